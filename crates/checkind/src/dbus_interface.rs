use crate::engine::{EngineError, EngineHandle};
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use zbus::interface;

pub const BUS_NAME: &str = "org.checkin.Recognizer1";
pub const OBJECT_PATH: &str = "/org/checkin/Recognizer1";

/// Training-request key selecting continue-training mode.
const CONTINUE_KEY: &str = "CONTINUE_TRAINING";

/// D-Bus front of the recognition engine. Results are returned as JSON.
pub struct RecognizerService {
    engine: EngineHandle,
}

impl RecognizerService {
    pub fn new(engine: EngineHandle) -> Self {
        Self { engine }
    }
}

fn failed(e: EngineError) -> zbus::fdo::Error {
    if let EngineError::Pipeline(inner) = &e {
        tracing::warn!(error = %inner, kind = ?inner.kind(), "request failed");
    } else {
        tracing::error!(error = %e, "engine unavailable");
    }
    zbus::fdo::Error::Failed(e.to_string())
}

fn json<T: Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
}

/// Zip the parallel key/value arrays of a training request.
fn training_payload(
    keys: Vec<String>,
    values: Vec<String>,
) -> zbus::fdo::Result<(HashMap<String, String>, bool)> {
    if keys.len() != values.len() {
        return Err(zbus::fdo::Error::InvalidArgs(format!(
            "{} keys but {} values",
            keys.len(),
            values.len()
        )));
    }
    let mut map: HashMap<String, String> = keys.into_iter().zip(values).collect();
    let continue_training = map
        .remove(CONTINUE_KEY)
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false);
    Ok((map, continue_training))
}

#[interface(name = "org.checkin.Recognizer1")]
impl RecognizerService {
    /// Identify the person in a cropped image.
    async fn identify(&self, path: &str) -> zbus::fdo::Result<String> {
        tracing::info!(path, "identify requested");
        let id = self.engine.identify(PathBuf::from(path)).await.map_err(failed)?;
        json(&id)
    }

    /// Detect every person in a photo and identify each of them.
    async fn process_photo(&self, path: &str) -> zbus::fdo::Result<String> {
        tracing::info!(path, "process_photo requested");
        let matches = self
            .engine
            .process_photo(PathBuf::from(path))
            .await
            .map_err(failed)?;
        json(&matches)
    }

    async fn verify(&self, path_a: &str, path_b: &str) -> zbus::fdo::Result<String> {
        tracing::info!(path_a, path_b, "verify requested");
        let result = self
            .engine
            .verify(PathBuf::from(path_a), PathBuf::from(path_b))
            .await
            .map_err(failed)?;
        json(&result)
    }

    /// Compare an image against an enrolled person's reference photo.
    async fn verify_person(&self, path: &str, person: &str) -> zbus::fdo::Result<String> {
        tracing::info!(path, person, "verify_person requested");
        let result = self
            .engine
            .verify_person(PathBuf::from(path), person.to_string())
            .await
            .map_err(failed)?;
        json(&result)
    }

    async fn verify_dataset(&self) -> zbus::fdo::Result<String> {
        tracing::info!("verify_dataset requested");
        let summary = self.engine.verify_dataset().await.map_err(failed)?;
        json(&summary)
    }

    /// Add a photo to a person's dataset folder. Returns the stored path.
    async fn enroll(&self, path: &str, person: &str) -> zbus::fdo::Result<String> {
        tracing::info!(path, person, "enroll requested");
        let saved = self
            .engine
            .enroll(PathBuf::from(path), person.to_string())
            .await
            .map_err(failed)?;
        Ok(saved.display().to_string())
    }

    /// Retrain the classifier. Keys: NUM_EPOCHS, LEARNING_RATE, MOMENTUM,
    /// CONTINUE_TRAINING.
    async fn train(&self, keys: Vec<String>, values: Vec<String>) -> zbus::fdo::Result<String> {
        let (overrides, continue_training) = training_payload(keys, values)?;
        tracing::info!(?overrides, continue_training, "train requested");
        let report = self
            .engine
            .train(overrides, continue_training)
            .await
            .map_err(failed)?;
        json(&report)
    }

    async fn labels(&self) -> zbus::fdo::Result<String> {
        let names = self.engine.labels().await.map_err(failed)?;
        json(&names)
    }

    async fn status(&self) -> zbus::fdo::Result<String> {
        let status = self.engine.status().await.map_err(failed)?;
        let mut value = serde_json::to_value(&status)
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
        value["version"] = serde_json::Value::from(env!("CARGO_PKG_VERSION"));
        Ok(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_training_payload() {
        let (map, cont) = training_payload(
            strings(&["NUM_EPOCHS", "CONTINUE_TRAINING"]),
            strings(&["10", "True"]),
        )
        .unwrap();
        assert!(cont);
        assert_eq!(map.len(), 1);
        assert_eq!(map["NUM_EPOCHS"], "10");

        let (_, cont) = training_payload(strings(&[]), strings(&[])).unwrap();
        assert!(!cont);
        assert!(training_payload(strings(&["A"]), strings(&[])).is_err());
    }
}
