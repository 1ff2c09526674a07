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

use crate::cache::Lookup;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::registry::Registry;

const OUTCOME_SUCCESS: &str = "success";
const OUTCOME_FAILURE: &str = "failure";

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct UpstreamLabels {
    upstream: String,
    outcome: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct CacheLabels {
    cache: String,
    result: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct OutcomeLabels {
    outcome: String,
}

/// Counters for upstream API calls, cache lookups, and dusk log writes.
///
/// All metrics are created and registered upon call to `ProxyMetrics::new()` and
/// share the prefix "radarb_". Clones share the same underlying counters.
#[derive(Debug, Clone)]
pub struct ProxyMetrics {
    upstream_requests: Family<UpstreamLabels, Counter>,
    cache_lookups: Family<CacheLabels, Counter>,
    dusk_log_writes: Family<OutcomeLabels, Counter>,
}

impl ProxyMetrics {
    pub fn new(reg: &mut Registry) -> Self {
        let upstream_requests = Family::<UpstreamLabels, Counter>::default();
        let cache_lookups = Family::<CacheLabels, Counter>::default();
        let dusk_log_writes = Family::<OutcomeLabels, Counter>::default();

        reg.register(
            "radarb_upstream_requests",
            "Requests made to upstream APIs by outcome",
            upstream_requests.clone(),
        );
        reg.register(
            "radarb_cache_lookups",
            "Cache lookups for upstream responses by result",
            cache_lookups.clone(),
        );
        reg.register(
            "radarb_dusk_log_writes",
            "Writes of civil twilight times to the dusk log by outcome",
            dusk_log_writes.clone(),
        );

        Self {
            upstream_requests,
            cache_lookups,
            dusk_log_writes,
        }
    }

    pub fn upstream_request(&self, upstream: &str, success: bool) {
        self.upstream_requests
            .get_or_create(&UpstreamLabels {
                upstream: upstream.to_owned(),
                outcome: outcome(success).to_owned(),
            })
            .inc();
    }

    pub fn cache_lookup(&self, cache: &str, lookup: Lookup) {
        self.cache_lookups
            .get_or_create(&CacheLabels {
                cache: cache.to_owned(),
                result: lookup.as_str().to_owned(),
            })
            .inc();
    }

    pub fn dusk_log_write(&self, success: bool) {
        self.dusk_log_writes
            .get_or_create(&OutcomeLabels {
                outcome: outcome(success).to_owned(),
            })
            .inc();
    }
}

fn outcome(success: bool) -> &'static str {
    if success {
        OUTCOME_SUCCESS
    } else {
        OUTCOME_FAILURE
    }
}
