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

//! Weather and traffic dashboard backend for Lakewood, Ohio
//!
//! ## Features
//!
//! `radarb` is a single HTTP server that the dashboard's static page talks to. It proxies
//! and reshapes a dozen upstream APIs so that API keys stay on the server and so that the
//! page gets exactly the data it renders.
//!
//! * Traffic cameras, road weather sensors, and incidents from [OHGO]. Cameras and sensors
//!   can be ranked by distance from a point.
//! * Flight delays from FlightAware AeroAPI and ground stops from the FAA for KCLE, along
//!   with runway crosswind alerts computed from the OpenWeatherMap hourly forecast.
//! * Current conditions from OpenWeatherMap and a personal Ambient Weather station.
//! * NWS digital DWML forecasts and NDFD snow amounts, both as raw XML and aligned to a
//!   single hourly timeline for the meteogram, with GFS snowfall extending the snow
//!   accumulation past the end of the NDFD forecast.
//! * Dawn, dusk, sunrise, and sunset from [sunrise-sunset.org], and a daily log of the
//!   end of civil twilight kept in Firestore.
//! * Lakewood City Schools closings during the winter season.
//! * An allow-listed radar image proxy and the latest Pivotal Weather HRRR precipitation map.
//!
//! Responses from slow or rate limited upstreams are cached in memory.
//!
//! [OHGO]: https://publicapi.ohgo.com/
//! [sunrise-sunset.org]: https://sunrise-sunset.org/api
//!
//! ## Build
//!
//! `radarb` is a Rust program and must be built from source using a [Rust toolchain](https://rustup.rs/).
//!
//! ```text
//! git clone git@github.com:56quarters/radarb.git && cd radarb
//! cargo build --release
//! ```
//!
//! ## Usage
//!
//! ### Secrets
//!
//! API keys are read from Google Cloud Secret Manager when running on Google Cloud, using
//! the instance metadata server for credentials. For local runs they can be set as
//! environment variables named after each secret instead.
//!
//! ```text
//! export RADARB_SECRET_OHGO_API=...
//! export RADARB_SECRET_OPENWEATHERMAP=...
//! ./radarb --secrets env --dusk-store memory
//! ```
//!
//! ### Endpoints
//!
//! Every endpoint is a `GET` on the path the dashboard already uses, for example
//! `/getDwmlMeteogramv1?lat=41.48&lng=-81.81`. All responses allow any origin.
//!
//! ### Prometheus
//!
//! Prometheus metrics for upstream requests, cache lookups, and dusk log writes are exposed
//! on port `9783` at `/metrics`.
//!

pub mod alerts;
pub mod cache;
pub mod client;
pub mod closings;
pub mod dusk_log;
pub mod dwml;
pub mod flight;
pub mod gcp;
pub mod http;
pub mod location;
pub mod meteogram;
pub mod metrics;
pub mod nws;
pub mod ohgo;
pub mod proximity;
pub mod radar;
pub mod secrets;
pub mod twilight;
pub mod weather;
