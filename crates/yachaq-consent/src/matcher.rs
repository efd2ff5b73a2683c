//! Local eligibility matching
//!
//! Matching reads only the local ODX. Nothing leaves the device: an ineligible
//! request is dropped silently and a cohort under the floor leaves an internal
//! audit record only.

use crate::predicate::{FacetSource, Predicate};
use crate::request::{Compensation, DataRequest, OutputMode};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info};
use yachaq_core::config::{MatchingConfig, PrivacyConfig};
use yachaq_core::{
    AuditEventType, AuditRecord, AuditSink, Effects, GeoCell, GeoResolution, MatchingMode,
    RequestId, Result,
};
use yachaq_crypto::sha256_parts;
use yachaq_odx::{OdxBuilder, OdxCriteria};

const REQUIRED_WEIGHT: f64 = 0.7;
const OPTIONAL_WEIGHT: f64 = 0.3;

/// An eligible request, ready to show the user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offer {
    /// Request id
    pub request_id: RequestId,
    /// Requester
    pub requester_id: String,
    /// Match quality in `[0, 1]`
    pub score: f64,
    /// Share of required labels published
    pub required_coverage: f64,
    /// Share of optional labels published
    pub optional_coverage: f64,
    /// Optional labels the device can supply
    pub optional_available: Vec<String>,
    /// Requested output mode
    pub output_mode: OutputMode,
    /// Offered compensation
    pub compensation: Compensation,
    /// Request expiry
    pub expires_at_ms: u64,
}

/// Result of local matching
#[derive(Debug, Clone, PartialEq)]
pub enum MatchOutcome {
    /// Offer for the user
    Eligible(Offer),
    /// Predicate false or request not addressed to this node; no reply is sent
    NotEligible,
    /// Predicate holds but a required facet is not published under the floor
    BelowKMin {
        /// First facet that fell short
        facet: String,
        /// Floor applied
        floor: u64,
    },
}

/// Rotating geo topic for a home cell in an epoch
pub fn geo_topic(home: &GeoCell, epoch: u64) -> String {
    let region = home.coarsen(GeoResolution::Region);
    let digest = sha256_parts(&[region.as_str().as_bytes(), &epoch.to_be_bytes()]);
    digest.to_hex()[..16].to_string()
}

/// Predicate view over the ODX under one floor
struct OdxFacets<'a> {
    odx: &'a OdxBuilder,
    floor: u64,
}

impl FacetSource for OdxFacets<'_> {
    fn count(&self, facet_key: &str) -> u64 {
        self.odx.cohort(facet_key, self.floor).total()
    }

    fn within(&self, area: &GeoCell) -> bool {
        let criteria = OdxCriteria {
            within: Some(area.clone()),
            min_count: Some(self.floor),
            ..OdxCriteria::default()
        };
        !self.odx.query(&criteria).is_empty()
    }
}

/// Evaluates requests against the local index
pub struct LocalMatcher {
    privacy: PrivacyConfig,
    matching: MatchingConfig,
    home: Option<GeoCell>,
    pending_load: AtomicUsize,
    audit: Arc<dyn AuditSink>,
    effects: Effects,
}

impl LocalMatcher {
    /// Matcher for a device whose coarse home cell is `home`
    pub fn new(
        privacy: PrivacyConfig,
        matching: MatchingConfig,
        home: Option<GeoCell>,
        audit: Arc<dyn AuditSink>,
        effects: Effects,
    ) -> Self {
        Self {
            privacy,
            matching,
            home,
            pending_load: AtomicUsize::new(0),
            audit,
            effects,
        }
    }

    /// Report the current number of pending requests
    pub fn observe_load(&self, pending: usize) {
        self.pending_load.store(pending, Ordering::Relaxed);
    }

    /// Mode in effect for the current load
    pub fn active_mode(&self) -> MatchingMode {
        let loaded = self.pending_load.load(Ordering::Relaxed)
            >= self.matching.geo_topic_capacity_threshold;
        if self.matching.mode == MatchingMode::GeoTopic
            || (self.matching.geo_topics_enabled && loaded)
        {
            MatchingMode::GeoTopic
        } else {
            MatchingMode::Broadcast
        }
    }

    /// This node's geo topic for the current epoch
    pub fn current_topic(&self) -> Option<String> {
        let epoch = self.effects.now_secs() / self.matching.topic_epoch_secs.max(1);
        self.home.as_ref().map(|home| geo_topic(home, epoch))
    }

    /// Match `request` against `odx`
    pub fn evaluate(&self, request: &DataRequest, odx: &OdxBuilder) -> Result<MatchOutcome> {
        let body = &request.body;
        let id = body.request_id;

        if self.active_mode() == MatchingMode::GeoTopic {
            let addressed = match (&body.geo_topic, self.current_topic()) {
                (Some(topic), Some(mine)) => *topic == mine,
                _ => false,
            };
            if !addressed {
                debug!(request_id = %id, "request not addressed to this geo topic");
                return Ok(MatchOutcome::NotEligible);
            }
        }

        let floor = self.privacy.k_min.max(body.k_min);
        let facets = OdxFacets { odx, floor };

        if let Some(area) = &body.target_area {
            if !facets.within(area) {
                debug!(request_id = %id, "outside target area");
                return Ok(MatchOutcome::NotEligible);
            }
        }

        let predicate = Predicate::parse(&body.eligibility_predicate, usize::MAX)?;
        if !predicate.evaluate(&facets) {
            debug!(request_id = %id, "predicate false");
            return Ok(MatchOutcome::NotEligible);
        }

        let window = body.scope.time_window;
        let published = |facet: &str| odx.facet_count(facet, floor, Some(&window)) > 0;

        let required = body
            .scope
            .required_labels
            .iter()
            .chain(predicate.positive_facets().iter())
            .find(|facet| !published(facet.as_str()))
            .cloned();
        if let Some(facet) = required {
            info!(request_id = %id, facet = %facet, floor, "cohort below k-min");
            self.audit.append(
                AuditRecord::new(AuditEventType::BelowKMin)
                    .with("request_id", id)
                    .with("facet_key", &facet)
                    .with("floor", floor),
            )?;
            return Ok(MatchOutcome::BelowKMin { facet, floor });
        }

        let optional_available: Vec<String> = body
            .scope
            .optional_labels
            .iter()
            .filter(|facet| published(facet.as_str()))
            .cloned()
            .collect();
        let optional_coverage = if body.scope.optional_labels.is_empty() {
            1.0
        } else {
            optional_available.len() as f64 / body.scope.optional_labels.len() as f64
        };
        let required_coverage = 1.0;
        let score = REQUIRED_WEIGHT * required_coverage + OPTIONAL_WEIGHT * optional_coverage;

        info!(request_id = %id, score, "offer surfaced");
        self.audit.append(
            AuditRecord::new(AuditEventType::OfferSurfaced)
                .with("request_id", id)
                .with("score", format!("{score:.2}")),
        )?;
        Ok(MatchOutcome::Eligible(Offer {
            request_id: id,
            requester_id: body.requester_id.clone(),
            score,
            required_coverage,
            optional_coverage,
            optional_available,
            output_mode: body.scope.output_mode,
            compensation: body.compensation.clone(),
            expires_at_ms: body.expires_at_ms,
        }))
    }
}

impl std::fmt::Debug for LocalMatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalMatcher")
            .field("k_min", &self.privacy.k_min)
            .field("mode", &self.active_mode())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::fixtures::body;
    use std::collections::BTreeSet;
    use yachaq_audit::AuditLog;
    use yachaq_core::time::MS_PER_DAY;
    use yachaq_core::RawRef;
    use yachaq_crypto::SigningIdentity;
    use yachaq_labels::{CanonicalEvent, EventCategory, Label};

    const T0: u64 = 1_772_447_400_000;

    fn trip(seed: u64, ts: u64, labels: &[&str]) -> CanonicalEvent {
        let (effects, _) = Effects::deterministic(seed, 0);
        let mut event = CanonicalEvent::new(
            "strava",
            EventCategory::Mobility,
            "trip",
            RawRef::generate(&effects),
            &format!("{seed}"),
            ts,
            ts,
        )
        .unwrap();
        event.coarse_geo_cell = Some(GeoCell::parse("PE:LIM:-12.0,-77.0").unwrap());
        event.labels = labels
            .iter()
            .map(|l| Label::parse(l).unwrap())
            .collect::<BTreeSet<_>>();
        event
    }

    struct Fixture {
        effects: Effects,
        audit: Arc<AuditLog>,
        odx: OdxBuilder,
        requester: SigningIdentity,
    }

    fn fixture(trips: u64, k_min: u64) -> Fixture {
        let (effects, _) = Effects::deterministic(5, T0);
        let audit = Arc::new(AuditLog::in_memory(effects.clone()));
        let privacy = PrivacyConfig {
            k_min,
            high_sensitivity_k_min: k_min * 2,
        };
        let odx = OdxBuilder::new(privacy, audit.clone());
        for i in 0..trips {
            let ts = T0 - (i % 60) * MS_PER_DAY;
            odx.upsert(&trip(100 + i, ts, &["mobility:trip", "mode:cycle"]))
                .unwrap();
        }
        let requester = SigningIdentity::generate(&effects);
        Fixture {
            effects,
            audit,
            odx,
            requester,
        }
    }

    fn matcher(f: &Fixture, k_min: u64, matching: MatchingConfig) -> LocalMatcher {
        LocalMatcher::new(
            PrivacyConfig {
                k_min,
                high_sensitivity_k_min: k_min * 2,
            },
            matching,
            Some(GeoCell::region("PE", "LIM").unwrap()),
            f.audit.clone(),
            f.effects.clone(),
        )
    }

    fn request(f: &Fixture, predicate: &str) -> DataRequest {
        DataRequest::sign(body(&f.effects, &f.requester, predicate), &f.requester).unwrap()
    }

    #[test]
    fn test_eligible_offer() {
        let f = fixture(120, 50);
        let m = matcher(&f, 50, MatchingConfig::default());
        let outcome = m.evaluate(&request(&f, "mobility.trip_count>10"), &f.odx).unwrap();
        let offer = match outcome {
            MatchOutcome::Eligible(offer) => offer,
            other => panic!("expected offer, got {other:?}"),
        };
        assert!((offer.score - 1.0).abs() < 1e-9);
        assert_eq!(offer.optional_available, vec!["mode:cycle".to_string()]);
        assert_eq!(
            f.audit.export().unwrap().event_types().last(),
            Some(&AuditEventType::OfferSurfaced)
        );
    }

    #[test]
    fn test_small_cohort_below_k_min() {
        let f = fixture(12, 50);
        let m = matcher(&f, 50, MatchingConfig::default());
        let outcome = m.evaluate(&request(&f, "mobility.trip_count>10"), &f.odx).unwrap();
        assert_eq!(
            outcome,
            MatchOutcome::BelowKMin {
                facet: "mobility:trip".into(),
                floor: 50
            }
        );
        let export = f.audit.export().unwrap();
        assert_eq!(export.of_type(AuditEventType::BelowKMin).len(), 1);
        assert!(export.of_type(AuditEventType::OfferSurfaced).is_empty());
    }

    #[test]
    fn test_false_predicate_is_silent() {
        let f = fixture(120, 50);
        let m = matcher(&f, 50, MatchingConfig::default());
        let before = f.audit.len();
        let outcome = m.evaluate(&request(&f, "mobility.trip_count > 1000"), &f.odx).unwrap();
        assert_eq!(outcome, MatchOutcome::NotEligible);
        assert_eq!(f.audit.len(), before);
    }

    #[test]
    fn test_request_k_min_raises_floor() {
        let f = fixture(120, 50);
        let m = matcher(&f, 50, MatchingConfig::default());
        let mut body = body(&f.effects, &f.requester, "has(mobility.trip)");
        body.k_min = 500;
        let request = DataRequest::sign(body, &f.requester).unwrap();
        assert_matches::assert_matches!(
            m.evaluate(&request, &f.odx).unwrap(),
            MatchOutcome::BelowKMin { floor: 500, .. }
        );
    }

    #[test]
    fn test_geo_topic_mode_under_load() {
        let f = fixture(120, 50);
        let config = MatchingConfig {
            geo_topics_enabled: true,
            geo_topic_capacity_threshold: 10,
            ..MatchingConfig::default()
        };
        let m = matcher(&f, 50, config);
        assert_eq!(m.active_mode(), MatchingMode::Broadcast);
        m.observe_load(10);
        assert_eq!(m.active_mode(), MatchingMode::GeoTopic);

        let untargeted = request(&f, "has(mobility.trip)");
        assert_eq!(m.evaluate(&untargeted, &f.odx).unwrap(), MatchOutcome::NotEligible);

        let mut body = body(&f.effects, &f.requester, "has(mobility.trip)");
        body.geo_topic = m.current_topic();
        let targeted = DataRequest::sign(body, &f.requester).unwrap();
        assert_matches::assert_matches!(
            m.evaluate(&targeted, &f.odx).unwrap(),
            MatchOutcome::Eligible(_)
        );
    }

    #[test]
    fn test_geo_topic_rotates_per_epoch() {
        let home = GeoCell::parse("PE:LIM:-12.0,-77.0").unwrap();
        let region = GeoCell::region("PE", "LIM").unwrap();
        assert_eq!(geo_topic(&home, 7), geo_topic(&region, 7));
        assert_ne!(geo_topic(&home, 7), geo_topic(&home, 8));
        assert_eq!(geo_topic(&home, 7).len(), 16);
    }

    #[test]
    fn test_target_area() {
        let f = fixture(120, 50);
        let m = matcher(&f, 50, MatchingConfig::default());
        let mut body = body(&f.effects, &f.requester, "has(mobility.trip)");
        body.target_area = Some(GeoCell::country("CO").unwrap());
        let request = DataRequest::sign(body, &f.requester).unwrap();
        assert_eq!(m.evaluate(&request, &f.odx).unwrap(), MatchOutcome::NotEligible);
    }
}
