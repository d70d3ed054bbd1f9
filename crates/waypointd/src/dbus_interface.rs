use std::sync::Arc;

use chrono::{DateTime, Utc};
use waypoint_core::{DetectionLoop, DetectionResult, Frame, FrameSender, PlaceRecognitionEngine};
use zbus::interface;
use zbus::object_server::SignalEmitter;

pub const BUS_NAME: &str = "org.waypoint.Recognizer1";
pub const OBJECT_PATH: &str = "/org/waypoint/Recognizer1";

/// D-Bus interface for the Waypoint place recognition daemon.
///
/// Bus name: org.waypoint.Recognizer1
/// Object path: /org/waypoint/Recognizer1
pub struct RecognizerService {
    engine: PlaceRecognitionEngine,
    frames: FrameSender,
    detection: Arc<DetectionLoop>,
    started_at: DateTime<Utc>,
}

impl RecognizerService {
    pub fn new(engine: PlaceRecognitionEngine, frames: FrameSender, detection: Arc<DetectionLoop>) -> Self {
        Self {
            engine,
            frames,
            detection,
            started_at: Utc::now(),
        }
    }
}

/// JSON body of the `PlaceDetected` signal.
pub fn detection_payload(result: &DetectionResult, at: DateTime<Utc>) -> serde_json::Result<String> {
    let mut value = serde_json::to_value(result)?;
    if let Some(obj) = value.as_object_mut() {
        obj.insert("timestamp".into(), serde_json::Value::String(at.to_rfc3339()));
    }
    serde_json::to_string(&value)
}

fn decode(image: &[u8]) -> zbus::fdo::Result<Frame> {
    Frame::decode(image).map_err(|e| zbus::fdo::Error::InvalidArgs(format!("image: {e}")))
}

fn to_json<T: serde::Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| zbus::fdo::Error::Failed(format!("serialization: {e}")))
}

#[interface(name = "org.waypoint.Recognizer1")]
impl RecognizerService {
    /// Run one detection against an encoded image and return the result as JSON.
    async fn detect(&self, image: Vec<u8>) -> zbus::fdo::Result<String> {
        let frame = decode(&image)?;
        tracing::info!(width = frame.width(), height = frame.height(), "detect requested");
        let result = self.engine.detect(frame).await;
        to_json(&result)
    }

    /// Offer an encoded frame to the detection loop. Returns false if it was dropped.
    async fn submit_frame(&self, image: Vec<u8>) -> zbus::fdo::Result<bool> {
        let frame = decode(&image)?;
        let accepted = self.frames.offer(frame);
        if !accepted {
            tracing::debug!("frame dropped; detection loop busy");
        }
        Ok(accepted)
    }

    /// Re-arm `PlaceDetected` after a detection has been handled.
    async fn acknowledge(&self) {
        tracing::info!("acknowledge requested");
        self.detection.acknowledge();
    }

    /// Rebuild the reference catalog and return the load report as JSON.
    async fn reload(&self) -> zbus::fdo::Result<String> {
        tracing::info!("reload requested");
        let report = self
            .engine
            .reload_catalog()
            .await
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
        to_json(&report)
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let catalog = self.engine.catalog().snapshot();
        let uptime = Utc::now().signed_duration_since(self.started_at);
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "initialized": self.engine.is_initialized().await,
            "places": catalog.len(),
            "references": catalog.reference_count(),
            "threshold": self.engine.threshold(),
            "model": self.engine.model_version(),
            "loop_state": self.detection.state(),
            "awaiting_acknowledgement": self.detection.awaiting_acknowledgement(),
            "loop_stats": self.detection.stats(),
            "started_at": self.started_at.to_rfc3339(),
            "uptime_secs": uptime.num_seconds(),
        })
        .to_string())
    }

    /// List cataloged places with their reference counts.
    async fn list_places(&self) -> zbus::fdo::Result<String> {
        let places: Vec<_> = self
            .engine
            .catalog()
            .all_places()
            .iter()
            .map(|p| serde_json::json!({ "id": p.id(), "references": p.len() }))
            .collect();
        to_json(&places)
    }

    /// Emitted when the detection loop recognizes a place.
    #[zbus(signal)]
    pub async fn place_detected(emitter: &SignalEmitter<'_>, result: &str) -> zbus::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_detection_payload_carries_timestamp() {
        let result = DetectionResult {
            detected: true,
            place_id: Some("office".into()),
            confidence: 0.9,
            best_candidate: Some("office".into()),
            matches_above_threshold: 3,
        };
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let payload = detection_payload(&result, at).unwrap();
        let value: serde_json::Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(value["place_id"], "office");
        assert_eq!(value["detected"], true);
        assert_eq!(value["timestamp"], "2024-05-01T12:00:00+00:00");
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(decode(b"not an image"), Err(zbus::fdo::Error::InvalidArgs(_))));
    }
}
