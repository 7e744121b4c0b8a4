//! Proximity Estimator
//!
//! Smoothed distance per peer from a sliding window of RSSI samples, blended
//! with the great-circle distance when both ends have coordinates, then
//! quantised into display buckets. Only presentation and feature gating
//! read it.

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

use crate::bluetooth::protocol::PeerId;

const EARTH_RADIUS_M: f64 = 6_371_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinates {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude }
    }

    /// Great-circle distance in metres
    pub fn haversine_m(&self, other: &Coordinates) -> f64 {
        let (lat1, lat2) = (self.latitude.to_radians(), other.latitude.to_radians());
        let d_lat = lat2 - lat1;
        let d_lon = (other.longitude - self.longitude).to_radians();
        let a = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lon / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_M * a.sqrt().atan2((1.0 - a).sqrt())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProximityConfig {
    /// RSSI samples kept per peer
    pub window: usize,
    /// Expected RSSI at one metre, dBm
    pub reference_power: f64,
    pub path_loss_exponent: f64,
    /// Below this many metres RSSI outweighs GPS
    pub blend_threshold_m: f64,
    /// Calls are offered only within this range
    pub call_range_m: f64,
}

impl Default for ProximityConfig {
    fn default() -> Self {
        Self {
            window: 5,
            reference_power: -59.0,
            path_loss_exponent: 2.0,
            blend_threshold_m: 10.0,
            call_range_m: 10.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DistanceBucket {
    Within10m,
    Within30m,
    Within50m,
    Within100m,
    Within150m,
    Within200m,
    Within250m,
    Beyond250m,
}

impl DistanceBucket {
    pub fn from_distance(metres: f64) -> Self {
        match metres {
            d if d <= 10.0 => DistanceBucket::Within10m,
            d if d <= 30.0 => DistanceBucket::Within30m,
            d if d <= 50.0 => DistanceBucket::Within50m,
            d if d <= 100.0 => DistanceBucket::Within100m,
            d if d <= 150.0 => DistanceBucket::Within150m,
            d if d <= 200.0 => DistanceBucket::Within200m,
            d if d <= 250.0 => DistanceBucket::Within250m,
            _ => DistanceBucket::Beyond250m,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            DistanceBucket::Within10m => "10m",
            DistanceBucket::Within30m => "30m",
            DistanceBucket::Within50m => "50m",
            DistanceBucket::Within100m => "100m",
            DistanceBucket::Within150m => "150m",
            DistanceBucket::Within200m => "200m",
            DistanceBucket::Within250m => "250m",
            DistanceBucket::Beyond250m => "250m+",
        }
    }
}

impl fmt::Display for DistanceBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DistanceEstimate {
    pub metres: f64,
    pub bucket: DistanceBucket,
}

#[derive(Debug, Default)]
struct PeerSamples {
    rssi: VecDeque<i16>,
    coordinates: Option<Coordinates>,
    bucket: Option<DistanceBucket>,
}

pub struct ProximityEstimator {
    config: ProximityConfig,
    peers: DashMap<PeerId, PeerSamples>,
    local_coordinates: RwLock<Option<Coordinates>>,
}

impl ProximityEstimator {
    pub fn new(config: ProximityConfig) -> Self {
        Self {
            config,
            peers: DashMap::new(),
            local_coordinates: RwLock::new(None),
        }
    }

    pub fn config(&self) -> &ProximityConfig {
        &self.config
    }

    pub fn set_local_coordinates(&self, coordinates: Option<Coordinates>) {
        *self.local_coordinates.write() = coordinates;
    }

    pub fn local_coordinates(&self) -> Option<Coordinates> {
        *self.local_coordinates.read()
    }

    pub fn record_coordinates(&self, peer: PeerId, coordinates: Coordinates) {
        self.peers.entry(peer).or_default().coordinates = Some(coordinates);
    }

    /// Add an RSSI sample. Returns the new bucket when it differs from the
    /// last one reported for this peer.
    pub fn record_rssi(&self, peer: PeerId, rssi: i16) -> Option<DistanceBucket> {
        let mut samples = self.peers.entry(peer).or_default();
        samples.rssi.push_back(rssi);
        while samples.rssi.len() > self.config.window.max(1) {
            samples.rssi.pop_front();
        }

        let bucket = self.estimate_from(&samples)?.bucket;
        if samples.bucket == Some(bucket) {
            return None;
        }
        samples.bucket = Some(bucket);
        Some(bucket)
    }

    /// Log-distance path loss over the mean of the window. Weaker signal
    /// means further away: the exponent is `(|rssi| - |reference|) / 10n`,
    /// so an RSSI below the 1 m reference power yields more than 1 m.
    pub fn rssi_distance(&self, mean_rssi: f64) -> f64 {
        let exponent = (mean_rssi.abs() - self.config.reference_power.abs())
            / (10.0 * self.config.path_loss_exponent);
        10f64.powf(exponent)
    }

    fn estimate_from(&self, samples: &PeerSamples) -> Option<DistanceEstimate> {
        if samples.rssi.is_empty() {
            return None;
        }
        let mean = samples.rssi.iter().map(|r| *r as f64).sum::<f64>() / samples.rssi.len() as f64;
        let from_rssi = self.rssi_distance(mean);

        let metres = match (self.local_coordinates(), samples.coordinates) {
            (Some(local), Some(remote)) => {
                let from_gps = local.haversine_m(&remote);
                let rssi_weight = if from_rssi < self.config.blend_threshold_m {
                    0.7
                } else {
                    0.3
                };
                rssi_weight * from_rssi + (1.0 - rssi_weight) * from_gps
            }
            _ => from_rssi,
        };
        Some(DistanceEstimate {
            metres,
            bucket: DistanceBucket::from_distance(metres),
        })
    }

    pub fn estimate(&self, peer: PeerId) -> Option<DistanceEstimate> {
        let samples = self.peers.get(&peer)?;
        self.estimate_from(&samples)
    }

    pub fn is_call_available(&self, peer: PeerId) -> bool {
        self.estimate(peer)
            .map(|e| e.metres <= self.config.call_range_m)
            .unwrap_or(false)
    }

    pub fn forget(&self, peer: PeerId) {
        self.peers.remove(&peer);
    }

    pub fn clear(&self) {
        self.peers.clear();
    }
}

impl Default for ProximityEstimator {
    fn default() -> Self {
        Self::new(ProximityConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_power_is_one_metre() {
        let estimator = ProximityEstimator::default();
        assert!((estimator.rssi_distance(-59.0) - 1.0).abs() < 1e-9);
        // every 20 dB is a factor of ten at n = 2
        assert!((estimator.rssi_distance(-79.0) - 10.0).abs() < 1e-9);
    }

    #[test]
    fn window_is_bounded_and_averaged() {
        let estimator = ProximityEstimator::default();
        let peer = PeerId(7);
        for _ in 0..10 {
            estimator.record_rssi(peer, -99);
        }
        for _ in 0..5 {
            estimator.record_rssi(peer, -79);
        }
        // only the last five samples count
        let estimate = estimator.estimate(peer).unwrap();
        assert!((estimate.metres - 10.0).abs() < 1e-9);
    }

    #[test]
    fn bucket_changes_are_reported_once() {
        let estimator = ProximityEstimator::default();
        let peer = PeerId(1);
        assert_eq!(estimator.record_rssi(peer, -60), Some(DistanceBucket::Within10m));
        assert_eq!(estimator.record_rssi(peer, -61), None);
        assert!(estimator.is_call_available(peer));
        assert!(!estimator.is_call_available(PeerId(2)));
    }

    #[test]
    fn buckets() {
        assert_eq!(DistanceBucket::from_distance(3.0), DistanceBucket::Within10m);
        assert_eq!(DistanceBucket::from_distance(30.0), DistanceBucket::Within30m);
        assert_eq!(DistanceBucket::from_distance(120.0), DistanceBucket::Within150m);
        assert_eq!(DistanceBucket::from_distance(900.0), DistanceBucket::Beyond250m);
        assert_eq!(DistanceBucket::Beyond250m.to_string(), "250m+");
    }

    #[test]
    fn haversine_one_degree_of_latitude() {
        let a = Coordinates::new(0.0, 0.0);
        let b = Coordinates::new(1.0, 0.0);
        assert!((a.haversine_m(&b) - 111_195.0).abs() < 1.0);
    }

    #[test]
    fn gps_blend_weights_flip_at_threshold() {
        let estimator = ProximityEstimator::default();
        let peer = PeerId(3);
        estimator.set_local_coordinates(Some(Coordinates::new(0.0, 0.0)));
        // ~111 m north
        estimator.record_coordinates(peer, Coordinates::new(0.001, 0.0));
        let gps = Coordinates::new(0.0, 0.0).haversine_m(&Coordinates::new(0.001, 0.0));

        // RSSI says 1 m: short range, RSSI weighted 0.7
        estimator.record_rssi(peer, -59);
        let near = estimator.estimate(peer).unwrap().metres;
        assert!((near - (0.7 * 1.0 + 0.3 * gps)).abs() < 1e-6);

        estimator.forget(peer);
        estimator.record_coordinates(peer, Coordinates::new(0.001, 0.0));
        // RSSI says 100 m: long range, GPS weighted 0.7
        estimator.record_rssi(peer, -99);
        let far = estimator.estimate(peer).unwrap().metres;
        assert!((far - (0.3 * 100.0 + 0.7 * gps)).abs() < 1e-6);
    }
}
