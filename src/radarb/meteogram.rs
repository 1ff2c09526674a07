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

use crate::dwml::{DwmlDocument, IconSeries, Selector, TimeSeries, WeatherHazard, WeatherSeries};
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

const CM_PER_INCH: f64 = 2.54;
const SECONDS_PER_HOUR: i64 = 3600;

#[derive(Debug, Error)]
pub enum MeteogramError {
    #[error("no hourly temperature data in forecast")]
    NoHourlyData,
    #[error("snowfall has {1} values for {0} times")]
    SnowTailMismatch(usize, usize),
}

/// High and low temperature for one calendar day of the forecast.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyHighLow {
    pub date: NaiveDate,
    pub high: i64,
    pub low: i64,
    pub icon: Option<String>,
}

/// Every forecast series aligned to the hourly temperature timeline.
///
/// Optional series are `None` when the forecast doesn't include them or when every
/// hour of the timeline is missing a value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Meteogram {
    pub times: Vec<DateTime<FixedOffset>>,
    pub units: String,
    pub temperature: Vec<Option<f64>>,
    pub feels_like: Vec<Option<f64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wind_chill: Option<Vec<Option<f64>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heat_index: Option<Vec<Option<f64>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub precipitation_probability: Option<Vec<Option<f64>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cloud_amount: Option<Vec<Option<f64>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wind: Option<Vec<Option<f64>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gust: Option<Vec<Option<f64>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weather: Option<WeatherSeries>,
    pub snow_accumulation: Vec<f64>,
    pub daily: Vec<DailyHighLow>,
    pub hazards: Vec<WeatherHazard>,
    pub has_hazards: bool,
    #[serde(skip)]
    snow_end: Option<DateTime<FixedOffset>>,
}

impl Meteogram {
    /// Align a digital forecast (and optionally an NDFD snow forecast) onto one
    /// hourly timeline defined by the hourly temperature.
    pub fn build(doc: &DwmlDocument<'_>, snow_doc: Option<&DwmlDocument<'_>>) -> Result<Self, MeteogramError> {
        let temperature = doc
            .series(Selector::HOURLY_TEMPERATURE)
            .filter(|s| !s.is_empty())
            .ok_or(MeteogramError::NoHourlyData)?;

        let timeline = temperature.times.clone();
        let feels_like = doc
            .first_series(&[Selector::APPARENT_TEMPERATURE, Selector::HEAT_INDEX, Selector::WIND_CHILL])
            .map(|s| align(&s, &timeline))
            .filter(|v| v.iter().any(Option::is_some))
            .unwrap_or_else(|| temperature.values.clone());

        let aligned = |selector: Selector| {
            doc.series(selector)
                .map(|s| align(&s, &timeline))
                .filter(|v| v.iter().any(Option::is_some))
        };

        let snow = snow_doc.and_then(|d| d.first_series(&[Selector::SNOW, Selector::SNOW_AMOUNT, Selector::SNOWFALL_AMOUNT]));
        let snow_accumulation = snow
            .as_ref()
            .map(|s| snow_accumulation(&timeline, s))
            .unwrap_or_default();
        let snow_end = snow.as_ref().and_then(|s| s.times.iter().max().copied());

        let daily = daily_high_low(
            doc.series(Selector::MAXIMUM_TEMPERATURE).as_ref(),
            doc.series(Selector::MINIMUM_TEMPERATURE).as_ref(),
            &temperature,
            doc.icon_series().as_ref(),
        );

        let hazards = doc.hazards();
        Ok(Meteogram {
            units: temperature.units.clone(),
            wind_chill: aligned(Selector::WIND_CHILL),
            heat_index: aligned(Selector::HEAT_INDEX),
            precipitation_probability: aligned(Selector::PRECIPITATION_PROBABILITY),
            cloud_amount: aligned(Selector::CLOUD_AMOUNT),
            wind: aligned(Selector::SUSTAINED_WIND),
            gust: aligned(Selector::WIND_GUST),
            weather: doc.weather_series().and_then(|w| align_weather(&w, &timeline)),
            temperature: temperature.values,
            feels_like,
            snow_accumulation,
            daily,
            has_hazards: !hazards.is_empty(),
            hazards,
            snow_end,
            times: timeline,
        })
    }

    /// True when the snow forecast stops before the end of the hourly timeline.
    pub fn snow_ends_early(&self) -> bool {
        match (self.snow_end, self.times.last()) {
            (Some(end), Some(last)) => !self.snow_accumulation.is_empty() && end < *last,
            _ => false,
        }
    }

    /// Extend snow accumulation past the end of the snow forecast using a longer range model.
    pub fn extend_snow(&mut self, tail: &SnowTail) {
        if !self.snow_ends_early() {
            return;
        }

        if let Some(end) = self.snow_end {
            self.snow_accumulation = extend_accumulation(&self.times, &self.snow_accumulation, end, tail);
        }
    }
}

/// Values of `series` at each time of `timeline`, `None` where the series has no point.
pub fn align(series: &TimeSeries, timeline: &[DateTime<FixedOffset>]) -> Vec<Option<f64>> {
    let mut by_time = HashMap::with_capacity(series.len());
    for (t, v) in series.times.iter().zip(series.values.iter()) {
        by_time.entry(*t).or_insert(*v);
    }

    timeline.iter().map(|t| by_time.get(t).copied().flatten()).collect()
}

fn align_weather(weather: &WeatherSeries, timeline: &[DateTime<FixedOffset>]) -> Option<WeatherSeries> {
    let mut index = HashMap::with_capacity(weather.times.len());
    for (i, t) in weather.times.iter().enumerate() {
        index.entry(*t).or_insert(i);
    }

    let pick = |values: &[Option<u8>]| -> Vec<Option<u8>> {
        timeline
            .iter()
            .map(|t| index.get(t).and_then(|i| values.get(*i).copied().flatten()))
            .collect()
    };

    let out = WeatherSeries {
        times: timeline.to_vec(),
        snow: pick(&weather.snow),
        rain: pick(&weather.rain),
        thunder: pick(&weather.thunder),
        sleet: pick(&weather.sleet),
        freezing_rain: pick(&weather.freezing_rain),
    };

    let any = [&out.snow, &out.rain, &out.thunder, &out.sleet, &out.freezing_rain]
        .iter()
        .any(|s| s.iter().any(Option::is_some));

    if any {
        Some(out)
    } else {
        None
    }
}

/// Running total of snow amounts valid at or before each hour of `timeline`.
pub fn snow_accumulation(timeline: &[DateTime<FixedOffset>], snow: &TimeSeries) -> Vec<f64> {
    let mut points: Vec<(DateTime<FixedOffset>, f64)> = snow
        .times
        .iter()
        .zip(snow.values.iter())
        .filter_map(|(t, v)| v.filter(|a| a.is_finite()).map(|a| (*t, a)))
        .collect();
    points.sort_by_key(|(t, _)| *t);

    let mut total = 0.0;
    let mut next = 0;
    let mut out = Vec::with_capacity(timeline.len());

    for hour in timeline {
        while next < points.len() && points[next].0 <= *hour {
            total += points[next].1;
            next += 1;
        }

        out.push(round2(total));
    }

    out
}

fn daily_high_low(
    max: Option<&TimeSeries>,
    min: Option<&TimeSeries>,
    hourly: &TimeSeries,
    icons: Option<&IconSeries>,
) -> Vec<DailyHighLow> {
    let days = match (max, min) {
        (Some(max), Some(min)) => daily_from_pairs(max, min, hourly),
        _ => daily_from_hourly(hourly),
    };

    days.into_iter()
        .map(|(date, high, low)| DailyHighLow {
            date,
            high,
            low,
            icon: icons.and_then(|i| icon_for_day(date, i)),
        })
        .collect()
}

fn daily_from_pairs(max: &TimeSeries, min: &TimeSeries, hourly: &TimeSeries) -> Vec<(NaiveDate, i64, i64)> {
    let mut out: Vec<(NaiveDate, i64, i64)> = max
        .times
        .iter()
        .zip(max.values.iter().zip(min.values.iter()))
        .take(min.times.len())
        .filter_map(|(t, pair)| match pair {
            (Some(high), Some(low)) => Some((t.date_naive(), round_half_up(*high), round_half_up(*low))),
            _ => None,
        })
        .collect();

    if let (Some(first), Some(start)) = (out.first_mut(), hourly.times.first()) {
        first.0 = start.date_naive();
    }

    out
}

fn daily_from_hourly(hourly: &TimeSeries) -> Vec<(NaiveDate, i64, i64)> {
    let mut by_day: BTreeMap<NaiveDate, (f64, f64)> = BTreeMap::new();
    for (t, v) in hourly.times.iter().zip(hourly.values.iter()) {
        if let Some(v) = v {
            let e = by_day.entry(t.date_naive()).or_insert((*v, *v));
            e.0 = e.0.max(*v);
            e.1 = e.1.min(*v);
        }
    }

    by_day
        .into_iter()
        .map(|(date, (high, low))| (date, round_half_up(high), round_half_up(low)))
        .collect()
}

fn icon_for_day(date: NaiveDate, icons: &IconSeries) -> Option<String> {
    icons
        .times
        .iter()
        .position(|t| t.date_naive() == date)
        .map(|i| icons.values[i].clone())
}

/// Hourly Open-Meteo response body, only the fields used for snowfall.
#[derive(Debug, Clone, Deserialize)]
pub struct OpenMeteoSnowfall {
    pub hourly: OpenMeteoHourly,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OpenMeteoHourly {
    pub time: Vec<String>,
    pub snowfall: Vec<Option<f64>>,
}

/// Accumulated snowfall in inches from a longer range model, keyed by UTC hour.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SnowTail {
    by_hour: HashMap<i64, f64>,
}

impl SnowTail {
    /// Accumulate hourly snowfall in centimeters (UTC times without an offset) into inches.
    pub fn from_open_meteo(res: &OpenMeteoSnowfall) -> Result<Self, MeteogramError> {
        let hourly = &res.hourly;
        if hourly.time.len() != hourly.snowfall.len() {
            return Err(MeteogramError::SnowTailMismatch(hourly.time.len(), hourly.snowfall.len()));
        }

        let mut total = 0.0;
        let mut by_hour = HashMap::with_capacity(hourly.time.len());

        for (time, cm) in hourly.time.iter().zip(hourly.snowfall.iter()) {
            total += cm.unwrap_or(0.0) / CM_PER_INCH;
            if let Some(t) = parse_utc_hour(time) {
                by_hour.insert(hour_key(&t), (total * 1000.0).round() / 1000.0);
            }
        }

        Ok(SnowTail { by_hour })
    }

    pub fn len(&self) -> usize {
        self.by_hour.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_hour.is_empty()
    }

    fn at<Tz: TimeZone>(&self, time: &DateTime<Tz>) -> Option<f64> {
        self.by_hour.get(&hour_key(time)).copied()
    }
}

/// Continue `accumulation` past `snow_end` with the growth of `tail` since `snow_end`.
///
/// Hours the tail doesn't cover carry the previous hour's value forward.
pub fn extend_accumulation(
    timeline: &[DateTime<FixedOffset>],
    accumulation: &[f64],
    snow_end: DateTime<FixedOffset>,
    tail: &SnowTail,
) -> Vec<f64> {
    let last_known = accumulation.last().copied().unwrap_or(0.0);
    let base = tail.at(&snow_end).unwrap_or(0.0);
    let mut out = Vec::with_capacity(timeline.len());

    for (i, time) in timeline.iter().enumerate() {
        let value = if *time <= snow_end {
            accumulation.get(i).copied().unwrap_or(last_known)
        } else if let Some(v) = tail.at(time) {
            round2(last_known + (v - base).max(0.0))
        } else {
            out.last().copied().unwrap_or(last_known)
        };

        out.push(value);
    }

    out
}

fn parse_utc_hour(raw: &str) -> Option<DateTime<Utc>> {
    let trimmed = raw.trim_end_matches('Z');
    NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M")
        .or_else(|_| NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S"))
        .ok()
        .map(|n| Utc.from_utc_datetime(&n))
}

fn hour_key<Tz: TimeZone>(time: &DateTime<Tz>) -> i64 {
    time.timestamp().div_euclid(SECONDS_PER_HOUR)
}

fn round_half_up(v: f64) -> i64 {
    (v + 0.5).floor() as i64
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::{
        align, extend_accumulation, snow_accumulation, DailyHighLow, Meteogram, MeteogramError, OpenMeteoHourly,
        OpenMeteoSnowfall, SnowTail,
    };
    use crate::dwml::{DwmlDocument, TimeSeries};
    use chrono::{DateTime, FixedOffset, NaiveDate};

    const FORECAST: &str = include_str!("../../testdata/digital_dwml.xml");
    const SNOW: &str = include_str!("../../testdata/ndfd_snow.xml");

    fn ts(s: &str) -> DateTime<FixedOffset> {
        DateTime::parse_from_rfc3339(s).unwrap()
    }

    fn hours(start: &str, n: usize) -> Vec<DateTime<FixedOffset>> {
        let start = ts(start);
        (0..n).map(|i| start + chrono::Duration::hours(i as i64)).collect()
    }

    fn tail(times: &[&str], snowfall_cm: &[Option<f64>]) -> SnowTail {
        let res = OpenMeteoSnowfall {
            hourly: OpenMeteoHourly {
                time: times.iter().map(|t| t.to_string()).collect(),
                snowfall: snowfall_cm.to_vec(),
            },
        };

        SnowTail::from_open_meteo(&res).unwrap()
    }

    #[test]
    fn test_build_aligned_series() {
        let doc = DwmlDocument::parse(FORECAST).unwrap();
        let m = Meteogram::build(&doc, None).unwrap();

        assert_eq!(5, m.times.len());
        assert_eq!("Fahrenheit", m.units);
        assert_eq!(vec![Some(30.0), Some(29.0), None, Some(27.0), Some(26.0)], m.temperature);
        assert_eq!(
            vec![Some(22.0), Some(21.0), Some(20.0), Some(19.0), Some(18.0)],
            m.feels_like
        );
        assert_eq!(Some(vec![None, Some(20.0), Some(22.0), Some(25.0), Some(26.0)]), m.gust);
        assert!(m.wind_chill.is_some());
        assert!(m.heat_index.is_none());
        assert!(m.snow_accumulation.is_empty());
        assert!(m.has_hazards);
        assert_eq!(2, m.hazards.len());

        let weather = m.weather.unwrap();
        assert_eq!(vec![None, Some(1), Some(2), None, None], weather.snow);
    }

    #[test]
    fn test_build_snow_accumulation() {
        let doc = DwmlDocument::parse(FORECAST).unwrap();
        let snow = DwmlDocument::parse(SNOW).unwrap();
        let m = Meteogram::build(&doc, Some(&snow)).unwrap();

        assert_eq!(vec![0.5, 0.5, 0.5, 1.75, 1.75], m.snow_accumulation);
        assert!(!m.snow_ends_early());
    }

    #[test]
    fn test_build_daily_from_max_min() {
        let doc = DwmlDocument::parse(FORECAST).unwrap();
        let m = Meteogram::build(&doc, None).unwrap();

        assert_eq!(
            vec![
                DailyHighLow {
                    date: NaiveDate::from_ymd_opt(2024, 1, 15).unwrap(),
                    high: 35,
                    low: 25,
                    icon: Some("https://forecast.weather.gov/images/wtf/nsn20.png".to_owned()),
                },
                DailyHighLow {
                    date: NaiveDate::from_ymd_opt(2024, 1, 16).unwrap(),
                    high: 33,
                    low: 20,
                    icon: Some("https://forecast.weather.gov/images/wtf/sn40.png".to_owned()),
                },
            ],
            m.daily
        );
    }

    #[test]
    fn test_build_daily_from_hourly() {
        let xml = r#"<dwml><data>
            <time-layout><layout-key>k1</layout-key>
              <start-valid-time>2024-07-01T22:00:00-04:00</start-valid-time>
              <start-valid-time>2024-07-01T23:00:00-04:00</start-valid-time>
              <start-valid-time>2024-07-02T00:00:00-04:00</start-valid-time>
              <start-valid-time>2024-07-02T01:00:00-04:00</start-valid-time>
            </time-layout>
            <parameters>
              <temperature type="hourly" units="Fahrenheit" time-layout="k1">
                <value>80.5</value><value>78</value><value>74.4</value><value>71</value>
              </temperature>
            </parameters>
        </data></dwml>"#;

        let doc = DwmlDocument::parse(xml).unwrap();
        let m = Meteogram::build(&doc, None).unwrap();

        assert_eq!(2, m.daily.len());
        assert_eq!(NaiveDate::from_ymd_opt(2024, 7, 1).unwrap(), m.daily[0].date);
        assert_eq!((81, 78), (m.daily[0].high, m.daily[0].low));
        assert_eq!((74, 71), (m.daily[1].high, m.daily[1].low));
        assert_eq!(None, m.daily[0].icon);
        assert_eq!(m.temperature, m.feels_like);
        assert!(m.weather.is_none());
        assert!(!m.has_hazards);
    }

    #[test]
    fn test_build_first_pair_redated() {
        let xml = r#"<dwml><data>
            <time-layout><layout-key>h</layout-key>
              <start-valid-time>2024-01-15T22:00:00-05:00</start-valid-time>
            </time-layout>
            <time-layout><layout-key>d</layout-key>
              <start-valid-time>2024-01-14T07:00:00-05:00</start-valid-time>
              <start-valid-time>2024-01-16T07:00:00-05:00</start-valid-time>
            </time-layout>
            <parameters>
              <temperature type="hourly" units="Fahrenheit" time-layout="h"><value>30</value></temperature>
              <temperature type="maximum" units="Fahrenheit" time-layout="d"><value>34.5</value><value xsi:nil="true" xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance"/></temperature>
              <temperature type="minimum" units="Fahrenheit" time-layout="d"><value>20</value><value>18</value></temperature>
            </parameters>
        </data></dwml>"#;

        let doc = DwmlDocument::parse(xml).unwrap();
        let m = Meteogram::build(&doc, None).unwrap();

        assert_eq!(1, m.daily.len());
        assert_eq!(NaiveDate::from_ymd_opt(2024, 1, 15).unwrap(), m.daily[0].date);
        assert_eq!(35, m.daily[0].high);
        assert_eq!(20, m.daily[0].low);
    }

    #[test]
    fn test_build_no_hourly_data() {
        let doc = DwmlDocument::parse("<dwml><data/></dwml>").unwrap();
        let res = Meteogram::build(&doc, None);
        assert!(matches!(res, Err(MeteogramError::NoHourlyData)));
    }

    #[test]
    fn test_align_by_timestamp() {
        let timeline = hours("2024-01-15T22:00:00-05:00", 3);
        let series = TimeSeries {
            times: vec![ts("2024-01-16T05:00:00Z"), ts("2024-01-15T23:00:00-05:00")],
            values: vec![Some(4.0), Some(3.0)],
            units: "mph".to_owned(),
        };

        assert_eq!(vec![None, Some(3.0), Some(4.0)], align(&series, &timeline));
    }

    #[test]
    fn test_snow_accumulation_monotonic() {
        let timeline = hours("2024-01-15T00:00:00-05:00", 12);
        let snow = TimeSeries {
            times: vec![
                ts("2024-01-15T00:00:00-05:00"),
                ts("2024-01-15T03:00:00-05:00"),
                ts("2024-01-15T06:00:00-05:00"),
                ts("2024-01-15T09:00:00-05:00"),
            ],
            values: vec![Some(0.1), None, Some(0.333), Some(0.0)],
            units: "inches".to_owned(),
        };

        let accum = snow_accumulation(&timeline, &snow);

        assert_eq!(timeline.len(), accum.len());
        assert_eq!(0.1, accum[0]);
        assert_eq!(0.1, accum[5]);
        assert_eq!(0.43, accum[6]);
        assert_eq!(0.43, accum[11]);
        assert!(accum.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_snow_tail_accumulates_inches() {
        let t = tail(
            &["2024-01-16T00:00", "2024-01-16T01:00", "2024-01-16T02:00"],
            &[Some(2.54), None, Some(1.27)],
        );

        assert_eq!(3, t.len());
        assert_eq!(Some(1.0), t.at(&ts("2024-01-16T00:00:00Z")));
        assert_eq!(Some(1.0), t.at(&ts("2024-01-15T20:00:00-05:00")));
        assert_eq!(Some(1.5), t.at(&ts("2024-01-16T02:00:00Z")));
    }

    #[test]
    fn test_snow_tail_length_mismatch() {
        let res = SnowTail::from_open_meteo(&OpenMeteoSnowfall {
            hourly: OpenMeteoHourly {
                time: vec!["2024-01-16T00:00".to_owned()],
                snowfall: vec![],
            },
        });

        assert!(matches!(res, Err(MeteogramError::SnowTailMismatch(1, 0))));
    }

    #[test]
    fn test_extend_accumulation() {
        // Timeline 00Z..05Z, snow forecast ends at 01Z.
        let timeline = hours("2024-01-16T00:00:00Z", 6);
        let accum = vec![0.5, 1.0, 1.0, 1.0, 1.0, 1.0];
        let t = tail(
            &["2024-01-16T01:00", "2024-01-16T02:00", "2024-01-16T03:00", "2024-01-16T05:00"],
            &[Some(2.54), Some(2.54), Some(0.0), Some(2.54)],
        );

        let extended = extend_accumulation(&timeline, &accum, ts("2024-01-16T01:00:00Z"), &t);

        assert_eq!(vec![0.5, 1.0, 2.0, 2.0, 2.0, 3.0], extended);
        assert!(extended.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_extend_snow_only_when_snow_ends_early() {
        let doc = DwmlDocument::parse(FORECAST).unwrap();
        let snow = DwmlDocument::parse(SNOW).unwrap();
        let mut m = Meteogram::build(&doc, Some(&snow)).unwrap();
        let before = m.snow_accumulation.clone();

        m.extend_snow(&tail(&["2024-01-16T07:00"], &[Some(25.4)]));

        assert_eq!(before, m.snow_accumulation);
    }
}
