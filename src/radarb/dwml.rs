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

//! Extraction of time series from NWS Digital Weather Markup Language documents.
//!
//! A DWML document holds a table of `<time-layout>` elements, each identified by a
//! `<layout-key>` and listing `<start-valid-time>` timestamps. Every data element
//! (temperature, wind, probability of precipitation, etc.) names the layout its
//! `<value>` children line up with via a `time-layout` attribute.

use chrono::{DateTime, FixedOffset};
use roxmltree::{Document, Node};
use serde::Serialize;
use std::collections::HashSet;
use thiserror::Error;

const XSI_NAMESPACE: &str = "http://www.w3.org/2001/XMLSchema-instance";

#[derive(Debug, Error)]
pub enum DwmlError {
    #[error("invalid DWML document: {0}")]
    Xml(#[from] roxmltree::Error),
}

/// Element name and optional `type` attribute identifying a data element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Selector {
    pub tag: &'static str,
    pub kind: Option<&'static str>,
}

impl Selector {
    pub const HOURLY_TEMPERATURE: Selector = Selector::typed("temperature", "hourly");
    pub const APPARENT_TEMPERATURE: Selector = Selector::typed("temperature", "apparent");
    pub const HEAT_INDEX: Selector = Selector::typed("temperature", "heat index");
    pub const WIND_CHILL: Selector = Selector::typed("temperature", "wind chill");
    pub const MAXIMUM_TEMPERATURE: Selector = Selector::typed("temperature", "maximum");
    pub const MINIMUM_TEMPERATURE: Selector = Selector::typed("temperature", "minimum");
    pub const PRECIPITATION_PROBABILITY: Selector = Selector::tag("probability-of-precipitation");
    pub const CLOUD_AMOUNT: Selector = Selector::tag("cloud-amount");
    pub const SUSTAINED_WIND: Selector = Selector::typed("wind-speed", "sustained");
    pub const WIND_GUST: Selector = Selector::typed("wind-speed", "gust");
    pub const SNOW: Selector = Selector::typed("precipitation", "snow");
    pub const SNOW_AMOUNT: Selector = Selector::tag("snow-amount");
    pub const SNOWFALL_AMOUNT: Selector = Selector::tag("snowfall-amount");

    pub const fn tag(tag: &'static str) -> Self {
        Selector { tag, kind: None }
    }

    pub const fn typed(tag: &'static str, kind: &'static str) -> Self {
        Selector { tag, kind: Some(kind) }
    }

    fn matches(&self, node: &Node) -> bool {
        node.is_element()
            && node.tag_name().name() == self.tag
            && self.kind.map(|k| node.attribute("type") == Some(k)).unwrap_or(true)
    }
}

/// Numeric values aligned with their valid times.
///
/// `times` and `values` always have the same length. Missing values (`xsi:nil` or
/// text that isn't a number) are `None`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimeSeries {
    pub times: Vec<DateTime<FixedOffset>>,
    pub values: Vec<Option<f64>>,
    pub units: String,
}

impl TimeSeries {
    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    /// Value whose valid time is exactly `time`, if any.
    pub fn value_at(&self, time: &DateTime<FixedOffset>) -> Option<f64> {
        self.times
            .iter()
            .position(|t| t == time)
            .and_then(|i| self.values[i])
    }
}

/// Ordinal severity of forecast weather from its coverage wording.
pub fn coverage_score(coverage: &str) -> u8 {
    match coverage {
        "slight chance" => 1,
        "chance" => 2,
        "likely" => 3,
        "occasional" | "definitely" => 4,
        _ => 0,
    }
}

/// Per-hour severity of each kind of precipitation.
///
/// A category is `None` for an hour when the forecast weather for that hour does
/// not mention it (or there is no forecast weather at all).
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WeatherSeries {
    pub times: Vec<DateTime<FixedOffset>>,
    pub snow: Vec<Option<u8>>,
    pub rain: Vec<Option<u8>>,
    pub thunder: Vec<Option<u8>>,
    pub sleet: Vec<Option<u8>>,
    pub freezing_rain: Vec<Option<u8>>,
}

impl WeatherSeries {
    fn push(&mut self, time: DateTime<FixedOffset>, condition: Option<(&str, &str)>) {
        self.times.push(time);

        let (coverage, weather_type) = match condition {
            Some(c) => c,
            None => {
                for series in self.categories_mut() {
                    series.push(None);
                }
                return;
            }
        };

        let coverage = coverage.to_lowercase();
        let weather_type = weather_type.to_lowercase();
        let score = coverage_score(&coverage);
        for (name, series) in WeatherSeries::CATEGORIES.iter().zip(self.categories_mut()) {
            series.push(if weather_type.contains(name) { Some(score) } else { None });
        }
    }

    const CATEGORIES: [&'static str; 5] = ["snow", "rain", "thunder", "sleet", "freezing rain"];

    fn categories_mut(&mut self) -> [&mut Vec<Option<u8>>; 5] {
        [
            &mut self.snow,
            &mut self.rain,
            &mut self.thunder,
            &mut self.sleet,
            &mut self.freezing_rain,
        ]
    }
}

/// Condition icon URLs aligned with their valid times.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IconSeries {
    pub times: Vec<DateTime<FixedOffset>>,
    pub values: Vec<String>,
}

/// A watch, warning, or advisory in effect for the forecast point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WeatherHazard {
    pub hazard_code: String,
    pub phenomena: String,
    pub significance: String,
    pub hazard_type: String,
    pub url: String,
}

impl WeatherHazard {
    fn dedup_key(&self) -> String {
        format!(
            "{}|{}|{}|{}",
            self.hazard_code, self.phenomena, self.significance, self.url
        )
    }
}

/// A parsed DWML document.
#[derive(Debug)]
pub struct DwmlDocument<'a> {
    doc: Document<'a>,
}

impl<'a> DwmlDocument<'a> {
    pub fn parse(xml: &'a str) -> Result<Self, DwmlError> {
        let doc = Document::parse(xml)?;
        Ok(DwmlDocument { doc })
    }

    /// Series for the first element matching `selector`, `None` if there isn't one.
    ///
    /// An element whose time layout can't be found yields an empty series.
    pub fn series(&self, selector: Selector) -> Option<TimeSeries> {
        let node = self.find(|n| selector.matches(n))?;
        let times = self.layout_times(node.attribute("time-layout"));
        let values: Vec<Option<f64>> = children_named(node, "value").map(|v| parse_value(&v)).collect();
        let units = node.attribute("units").unwrap_or_default().to_owned();

        let mut series = TimeSeries {
            times: Vec::with_capacity(times.len()),
            values: Vec::with_capacity(values.len()),
            units,
        };

        for (time, value) in times.into_iter().zip(values) {
            if let Some(time) = time {
                series.times.push(time);
                series.values.push(value);
            }
        }

        Some(series)
    }

    /// Series for the first of `selectors` present in the document.
    pub fn first_series(&self, selectors: &[Selector]) -> Option<TimeSeries> {
        selectors.iter().find_map(|s| self.series(*s))
    }

    /// Precipitation categories from the first `<weather>` element.
    pub fn weather_series(&self) -> Option<WeatherSeries> {
        let node = self.find(|n| n.has_tag_name("weather"))?;
        let times = self.layout_times(node.attribute("time-layout"));
        let mut series = WeatherSeries::default();

        for (time, conditions) in times.into_iter().zip(children_named(node, "weather-conditions")) {
            let time = match time {
                Some(t) => t,
                None => continue,
            };

            let condition = children_named(conditions, "value").next().map(|v| {
                (
                    v.attribute("coverage").unwrap_or_default(),
                    v.attribute("weather-type").unwrap_or_default(),
                )
            });

            series.push(time, condition);
        }

        Some(series)
    }

    /// Icon URLs from the first `<conditions-icon>` element.
    pub fn icon_series(&self) -> Option<IconSeries> {
        let node = self.find(|n| n.has_tag_name("conditions-icon"))?;
        let times = self.layout_times(node.attribute("time-layout"));
        let mut series = IconSeries::default();

        for (time, icon) in times.into_iter().zip(children_named(node, "icon-link")) {
            if let Some(time) = time {
                series.times.push(time);
                series.values.push(text_of(&icon));
            }
        }

        Some(series)
    }

    /// Hazards from the first `<hazards>` element, deduplicated in document order.
    pub fn hazards(&self) -> Vec<WeatherHazard> {
        let node = match self.find(|n| n.has_tag_name("hazards")) {
            Some(n) => n,
            None => return Vec::new(),
        };

        let mut seen = HashSet::new();
        let mut out = Vec::new();

        for hazard in children_named(node, "hazard") {
            let url = children_named(hazard, "hazardTextURL")
                .next()
                .map(|n| text_of(&n))
                .unwrap_or_default();

            let h = WeatherHazard {
                hazard_code: hazard.attribute("hazardCode").unwrap_or_default().to_owned(),
                phenomena: hazard.attribute("phenomena").unwrap_or_default().to_owned(),
                significance: hazard.attribute("significance").unwrap_or_default().to_owned(),
                hazard_type: hazard.attribute("hazardType").unwrap_or_default().to_owned(),
                url,
            };

            if seen.insert(h.dedup_key()) {
                out.push(h);
            }
        }

        out
    }

    /// Valid start times of the layout named `key`, skipping any that can't be parsed.
    pub fn time_layout(&self, key: &str) -> Option<Vec<DateTime<FixedOffset>>> {
        self.layout_node(key)
            .map(|layout| start_times(layout).into_iter().flatten().collect())
    }

    fn layout_node(&self, key: &str) -> Option<Node<'_, 'a>> {
        self.doc.descendants().filter(|n| n.has_tag_name("time-layout")).find(|layout| {
            children_named(*layout, "layout-key")
                .next()
                .map(|k| k.text().unwrap_or_default() == key)
                .unwrap_or(false)
        })
    }

    fn layout_times(&self, key: Option<&str>) -> Vec<Option<DateTime<FixedOffset>>> {
        key.and_then(|k| self.layout_node(k)).map(start_times).unwrap_or_default()
    }

    fn find<F>(&self, pred: F) -> Option<Node<'_, 'a>>
    where
        F: Fn(&Node) -> bool,
    {
        self.doc.descendants().find(|n| pred(n))
    }
}

/// Element descendants of `node` (excluding itself) with the given local name.
fn children_named<'a, 'input: 'a>(
    node: Node<'a, 'input>,
    name: &'static str,
) -> impl Iterator<Item = Node<'a, 'input>> {
    node.descendants()
        .skip(1)
        .filter(move |n| n.is_element() && n.tag_name().name() == name)
}

fn start_times(layout: Node) -> Vec<Option<DateTime<FixedOffset>>> {
    children_named(layout, "start-valid-time")
        .map(|n| DateTime::parse_from_rfc3339(n.text().unwrap_or_default().trim()).ok())
        .collect()
}

fn parse_value(node: &Node) -> Option<f64> {
    if node.attribute((XSI_NAMESPACE, "nil")) == Some("true") {
        return None;
    }

    node.text()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .and_then(|t| t.parse::<f64>().ok())
        .filter(|v| v.is_finite())
}

fn text_of(node: &Node) -> String {
    node.text().unwrap_or_default().trim().to_owned()
}
