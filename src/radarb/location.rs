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

//! Fixed places the dashboard reports on.

use crate::ohgo::Bounds;
use crate::proximity::Coordinate;
use chrono_tz::Tz;

/// Lakewood, Ohio.
pub const HOME: Coordinate = Coordinate::new(41.48, -81.81);

pub const TIME_ZONE: Tz = chrono_tz::America::New_York;

/// Cleveland Hopkins International Airport.
pub const KCLE: Airport = Airport {
    icao: "KCLE",
    faa: "cle",
    runway_heading: 58.1,
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Airport {
    pub icao: &'static str,
    pub faa: &'static str,
    /// Magnetic heading of the primary runway, in degrees.
    pub runway_heading: f64,
}

/// Map area around home used for traffic incidents.
pub fn home_bounds() -> Bounds {
    Bounds::new("41.46", "-81.83", "41.49", "-81.75")
}
