// radarb - Weather and traffic dashboard backend for Lakewood, Ohio
//
// Copyright 2022 Nick Pillitteri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.
//

use crate::alerts::AlertSources;
use crate::client::{Endpoints, UpstreamClient};
use crate::closings::ClosingsService;
use crate::dusk_log::DuskLog;
use crate::flight::FlightService;
use crate::location::{TIME_ZONE, KCLE};
use crate::nws::NwsService;
use crate::ohgo::{Bounds, OhgoService};
use crate::proximity::Coordinate;
use crate::radar::{sanitize_radar_url, RadarConfig, RadarService};
use crate::secrets::SecretCache;
use crate::twilight::{TwilightError, TwilightService, DEFAULT_TIME_ZONE};
use crate::weather::WeatherService;
use axum::extract::{Query, State};
use axum::http::header::{
    ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN, CACHE_CONTROL,
    CONTENT_TYPE,
};
use axum::http::{HeaderValue, Method, Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, NaiveDate, Utc};
use prometheus_client::registry::Registry;
use serde::Deserialize;
use serde_json::json;
use std::fmt;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

const OPENMETRICS_CONTENT_TYPE: &str = "application/openmetrics-text; version=1.0.0; charset=utf-8";
const XML_CONTENT_TYPE: &str = "application/xml; charset=utf-8";
const MISSING_LAT_LNG: &str = "lat and lng are required";

/// Current time for handlers that depend on the calendar date.
pub trait Clock: fmt::Debug + Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Everything handlers need, shared between every request.
#[derive(Debug)]
pub struct RequestContext {
    registry: Registry,
    ohgo: OhgoService,
    flight: FlightService,
    weather: WeatherService,
    nws: NwsService,
    twilight: TwilightService,
    closings: ClosingsService,
    radar: RadarService,
    dusk_log: Arc<dyn DuskLog>,
    clock: Arc<dyn Clock>,
}

impl RequestContext {
    pub fn new(
        registry: Registry,
        client: UpstreamClient,
        secrets: Arc<SecretCache>,
        endpoints: &Endpoints,
        radar: RadarConfig,
        dusk_log: Arc<dyn DuskLog>,
    ) -> Self {
        RequestContext {
            registry,
            ohgo: OhgoService::new(client.clone(), secrets.clone(), &endpoints.ohgo),
            flight: FlightService::new(client.clone(), secrets.clone(), &endpoints.aeroapi, &endpoints.faa),
            weather: WeatherService::new(
                client.clone(),
                secrets.clone(),
                &endpoints.openweathermap,
                &endpoints.ambient_weather,
                &endpoints.geocode,
            ),
            nws: NwsService::new(
                client.clone(),
                &endpoints.ndfd,
                &endpoints.dwml,
                &endpoints.open_meteo_gfs,
            ),
            twilight: TwilightService::new(client.clone(), &endpoints.sunrise_sunset),
            closings: ClosingsService::new(
                client.clone(),
                secrets,
                &endpoints.spectrum_closings,
                &endpoints.fox8_closings,
                &endpoints.vertex,
            ),
            radar: RadarService::new(client, radar, &endpoints.pivotal),
            dusk_log,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn twilight(&self) -> &TwilightService {
        &self.twilight
    }

    pub fn dusk_log(&self) -> &dyn DuskLog {
        self.dusk_log.as_ref()
    }

    /// Today's date at home.
    fn today(&self) -> NaiveDate {
        self.clock.now().with_timezone(&TIME_ZONE).date_naive()
    }

    fn alert_sources(&self) -> AlertSources<'_> {
        AlertSources {
            flight: &self.flight,
            weather: &self.weather,
            nws: &self.nws,
            closings: &self.closings,
            ohgo: &self.ohgo,
        }
    }
}

/// Every dashboard endpoint plus Prometheus metrics, with CORS headers on all responses.
pub fn router(context: Arc<RequestContext>) -> Router {
    Router::new()
        .route("/getCameraDatav2", get(camera_data))
        .route("/getSensorDatav2", get(sensor_data))
        .route("/getOhgoIncidentsv1", get(ohgo_incidents))
        .route("/getFlightDelaysv2", get(flight_delays))
        .route("/getGroundStopInfov2", get(ground_stop_info))
        .route("/getCityNamev2", get(city_name))
        .route("/getWeatherDatav2", get(weather_data))
        .route("/getAmbientWeatherDatav2", get(ambient_weather_data))
        .route("/getNdfdSnowv1", get(ndfd_snow))
        .route("/getDwmlForecastv1", get(dwml_forecast))
        .route("/getDwmlMeteogramv1", get(dwml_meteogram))
        .route("/getTwilightTimesv1", get(twilight_times))
        .route("/getSchoolClosingsv1", get(school_closings))
        .route("/grabPivotalHRRR6hQPFv2", get(pivotal_hrrr_qpf))
        .route("/getRadarProxyv1", get(radar_proxy))
        .route("/getActiveAlertsv1", get(active_alerts))
        .route("/getDuskLogv1", get(dusk_log))
        .route("/metrics", get(text_metrics))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(cors))
        .with_state(context)
}

/// Allow any origin and answer preflight requests without running a handler.
async fn cors<B>(req: Request<B>, next: Next<B>) -> Response {
    let mut res = if req.method() == Method::OPTIONS {
        StatusCode::NO_CONTENT.into_response()
    } else {
        next.run(req).await
    };

    let headers = res.headers_mut();
    headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    headers.insert(ACCESS_CONTROL_ALLOW_METHODS, HeaderValue::from_static("GET, POST, OPTIONS"));
    headers.insert(ACCESS_CONTROL_ALLOW_HEADERS, HeaderValue::from_static("Content-Type"));
    res
}

/// Failure of a handler, rendered the way dashboard clients expect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    /// 400 with a JSON `error` body.
    BadRequest(String),
    /// 404 with a JSON `error` body.
    NotFound(&'static str),
    /// 500 with a plain text body.
    Upstream(&'static str),
    /// 500 with a JSON `error` body.
    UpstreamJson(&'static str),
}

impl ApiError {
    fn upstream<E: fmt::Display>(response: &'static str) -> impl FnOnce(E) -> ApiError {
        move |e| {
            tracing::error!(message = "upstream request failed", response = response, error = %e);
            ApiError::Upstream(response)
        }
    }

    fn upstream_json<E: fmt::Display>(response: &'static str) -> impl FnOnce(E) -> ApiError {
        move |e| {
            tracing::error!(message = "upstream request failed", response = response, error = %e);
            ApiError::UpstreamJson(response)
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, Json(json!({ "error": msg }))).into_response(),
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, Json(json!({ "error": msg }))).into_response(),
            Self::Upstream(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg).into_response(),
            Self::UpstreamJson(msg) => {
                (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": msg }))).into_response()
            }
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct LocationQuery {
    lat: Option<String>,
    lng: Option<String>,
    tz: Option<String>,
}

impl LocationQuery {
    fn required(&self) -> Result<(&str, &str), ApiError> {
        match (non_empty(&self.lat), non_empty(&self.lng)) {
            (Some(lat), Some(lng)) => Ok((lat, lng)),
            _ => Err(ApiError::BadRequest(MISSING_LAT_LNG.to_owned())),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct MapQuery {
    latsw: Option<String>,
    lngsw: Option<String>,
    latne: Option<String>,
    lngne: Option<String>,
    lat: Option<String>,
    lng: Option<String>,
}

impl MapQuery {
    fn bounds(&self) -> Result<Bounds, ApiError> {
        Bounds::from_parts(
            self.latsw.as_deref(),
            self.lngsw.as_deref(),
            self.latne.as_deref(),
            self.lngne.as_deref(),
        )
        .ok_or_else(|| ApiError::BadRequest("map bounds are required".to_owned()))
    }

    /// Point to rank results from, `None` to return results as they came from OHGO.
    fn origin(&self) -> Result<Option<Coordinate>, ApiError> {
        match (non_empty(&self.lat), non_empty(&self.lng)) {
            (Some(lat), Some(lng)) => match (lat.parse::<f64>(), lng.parse::<f64>()) {
                (Ok(lat), Ok(lng)) if lat.is_finite() && lng.is_finite() => Ok(Some(Coordinate::new(lat, lng))),
                _ => Err(ApiError::BadRequest("lat and lng must be numbers".to_owned())),
            },
            _ => Ok(None),
        }
    }
}

fn non_empty(v: &Option<String>) -> Option<&str> {
    v.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

async fn camera_data(
    State(context): State<Arc<RequestContext>>,
    Query(query): Query<MapQuery>,
) -> Result<Response, ApiError> {
    const ERROR: &str = "Error retrieving data";
    let bounds = query.bounds()?;

    match query.origin()? {
        Some(origin) => {
            let ranked = context
                .ohgo
                .nearest_cameras(&bounds, origin)
                .await
                .map_err(ApiError::upstream_json(ERROR))?;
            Ok(Json(ranked).into_response())
        }
        None => {
            let body = context.ohgo.cameras(&bounds).await.map_err(ApiError::upstream_json(ERROR))?;
            Ok(Json(body).into_response())
        }
    }
}

async fn sensor_data(
    State(context): State<Arc<RequestContext>>,
    Query(query): Query<MapQuery>,
) -> Result<Response, ApiError> {
    const ERROR: &str = "Error retrieving data";
    let bounds = query.bounds()?;

    match query.origin()? {
        Some(origin) => {
            let ranked = context
                .ohgo
                .nearest_sensors(&bounds, origin)
                .await
                .map_err(ApiError::upstream_json(ERROR))?;
            Ok(Json(ranked).into_response())
        }
        None => {
            let body = context.ohgo.sensors(&bounds).await.map_err(ApiError::upstream_json(ERROR))?;
            Ok(Json(body).into_response())
        }
    }
}

async fn ohgo_incidents(
    State(context): State<Arc<RequestContext>>,
    Query(query): Query<MapQuery>,
) -> Result<Response, ApiError> {
    let bounds = query.bounds()?;
    let body = context
        .ohgo
        .incidents(&bounds)
        .await
        .map_err(ApiError::upstream_json("Error retrieving incidents"))?;

    Ok(Json(body).into_response())
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AirportQuery {
    airport_code: Option<String>,
}

async fn flight_delays(
    State(context): State<Arc<RequestContext>>,
    Query(query): Query<AirportQuery>,
) -> Result<Response, ApiError> {
    let airport = non_empty(&query.airport_code).unwrap_or(KCLE.icao);
    let reasons = context
        .flight
        .delays(airport)
        .await
        .map_err(ApiError::upstream("Error retrieving flight delays."))?;

    Ok(reasons.into_response())
}

async fn ground_stop_info(State(context): State<Arc<RequestContext>>) -> Result<Response, ApiError> {
    let status = context
        .flight
        .ground_stops(KCLE.faa)
        .await
        .map_err(ApiError::upstream("Error fetching ground stop information"))?;

    Ok(match status {
        Some(s) => Json(s).into_response(),
        None => StatusCode::OK.into_response(),
    })
}

async fn city_name(
    State(context): State<Arc<RequestContext>>,
    Query(query): Query<LocationQuery>,
) -> Result<Response, ApiError> {
    let (lat, lng) = query.required()?;
    let city = context
        .weather
        .city_name(lat, lng)
        .await
        .map_err(ApiError::upstream("Error retrieving city name."))?
        .ok_or(ApiError::NotFound("No address found"))?;

    Ok(Json(city).into_response())
}

async fn weather_data(
    State(context): State<Arc<RequestContext>>,
    Query(query): Query<LocationQuery>,
) -> Result<Response, ApiError> {
    let (lat, lng) = query.required()?;
    let body = context
        .weather
        .onecall(lat, lng)
        .await
        .map_err(ApiError::upstream("Error fetching weather data."))?;

    Ok(Json(body).into_response())
}

async fn ambient_weather_data(State(context): State<Arc<RequestContext>>) -> Result<Response, ApiError> {
    let body = context
        .weather
        .ambient()
        .await
        .map_err(ApiError::upstream_json("Error retrieving Ambient Weather data"))?;

    Ok(Json(body).into_response())
}

async fn ndfd_snow(
    State(context): State<Arc<RequestContext>>,
    Query(query): Query<LocationQuery>,
) -> Result<Response, ApiError> {
    let (lat, lng) = query.required()?;
    let xml = context
        .nws
        .ndfd_snow(lat, lng)
        .await
        .map_err(ApiError::upstream("Error fetching NDFD snow data."))?;

    Ok(([(CONTENT_TYPE, XML_CONTENT_TYPE)], xml).into_response())
}

async fn dwml_forecast(
    State(context): State<Arc<RequestContext>>,
    Query(query): Query<LocationQuery>,
) -> Result<Response, ApiError> {
    let (lat, lng) = query.required()?;
    let xml = context
        .nws
        .dwml_forecast(lat, lng)
        .await
        .map_err(ApiError::upstream("Error fetching DWML forecast data."))?;

    Ok(([(CONTENT_TYPE, XML_CONTENT_TYPE)], xml).into_response())
}

async fn dwml_meteogram(
    State(context): State<Arc<RequestContext>>,
    Query(query): Query<LocationQuery>,
) -> Result<Response, ApiError> {
    let (lat, lng) = query.required()?;
    let meteogram = context
        .nws
        .meteogram(lat, lng)
        .await
        .map_err(ApiError::upstream("Error building DWML meteogram."))?;

    Ok(Json(meteogram).into_response())
}

async fn twilight_times(
    State(context): State<Arc<RequestContext>>,
    Query(query): Query<LocationQuery>,
) -> Result<Response, ApiError> {
    let (lat, lng) = query.required()?;
    let tz = non_empty(&query.tz).unwrap_or(DEFAULT_TIME_ZONE);

    match context.twilight.times(lat, lng, tz).await {
        Ok(times) => Ok(Json(times).into_response()),
        Err(e @ TwilightError::UnknownTimeZone(_)) => Err(ApiError::BadRequest(e.to_string())),
        Err(e) => Err(ApiError::upstream("Error fetching twilight times.")(e)),
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ClosingsQuery {
    debug: Option<String>,
}

async fn school_closings(
    State(context): State<Arc<RequestContext>>,
    Query(query): Query<ClosingsQuery>,
) -> Response {
    let today = context.today();
    let debug = query.debug.as_deref() == Some("1");

    match context.closings.closings(today, debug).await {
        Some(report) => Json(report).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

async fn pivotal_hrrr_qpf(State(context): State<Arc<RequestContext>>) -> Result<Response, ApiError> {
    let image = context
        .radar
        .pivotal_hrrr_qpf()
        .await
        .map_err(ApiError::upstream("Error fetching image URL"))?;

    Ok(Json(image).into_response())
}

#[derive(Debug, Default, Deserialize)]
pub struct RadarQuery {
    url: Option<String>,
}

async fn radar_proxy(
    State(context): State<Arc<RequestContext>>,
    Query(query): Query<RadarQuery>,
) -> Result<Response, ApiError> {
    let url = sanitize_radar_url(query.url.as_deref(), context.radar.config())
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let image = context
        .radar
        .image(url)
        .await
        .map_err(ApiError::upstream_json("Error retrieving radar image"))?;

    let cache_control = context.radar.config().cache_control();
    Ok((
        [(CONTENT_TYPE, image.content_type), (CACHE_CONTROL, cache_control)],
        image.body,
    )
        .into_response())
}

async fn active_alerts(State(context): State<Arc<RequestContext>>) -> Response {
    let today = context.today();
    let alerts = context.alert_sources().active_alerts(&KCLE, today).await;
    Json(alerts).into_response()
}

#[derive(Debug, Default, Deserialize)]
pub struct DuskLogQuery {
    date: Option<String>,
}

async fn dusk_log(
    State(context): State<Arc<RequestContext>>,
    Query(query): Query<DuskLogQuery>,
) -> Result<Response, ApiError> {
    let date = non_empty(&query.date)
        .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
        .ok_or_else(|| ApiError::BadRequest("date must be YYYY-MM-DD".to_owned()))?;

    let record = context
        .dusk_log
        .get(date)
        .await
        .map_err(ApiError::upstream_json("Error retrieving dusk log"))?
        .ok_or(ApiError::NotFound("No dusk time logged"))?;

    Ok(Json(record).into_response())
}

async fn text_metrics(State(context): State<Arc<RequestContext>>) -> Response {
    let mut buf = String::new();
    match prometheus_client::encoding::text::encode(&mut buf, &context.registry) {
        Ok(_) => {
            tracing::debug!(message = "encoded prometheus metrics to text format", num_bytes = buf.len());
            ([(CONTENT_TYPE, OPENMETRICS_CONTENT_TYPE)], buf).into_response()
        }
        Err(e) => {
            tracing::error!(message = "error encoding metrics", error = %e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
