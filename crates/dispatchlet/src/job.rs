//! Job envelopes: the unit of work handed from supervisor to worker.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Keyword parameters for a routine invocation.
pub type Params = serde_json::Map<String, serde_json::Value>;

/// Globally unique job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(uuid::Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }

    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        let uuid = uuid::Uuid::parse_str(s)?;
        Ok(Self(uuid))
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A routine call bound to a fresh identifier. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct JobEnvelope {
    id: JobId,
    routine: String,
    params: Params,
}

impl JobEnvelope {
    pub fn new(routine: impl Into<String>, params: Params) -> Self {
        Self {
            id: JobId::new(),
            routine: routine.into(),
            params,
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn routine(&self) -> &str {
        &self.routine
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn into_parts(self) -> (JobId, String, Params) {
        (self.id, self.routine, self.params)
    }
}

/// Deserialize a required keyword parameter.
pub fn required<T: DeserializeOwned>(params: &Params, name: &str) -> anyhow::Result<T> {
    let value = params
        .get(name)
        .ok_or_else(|| anyhow::anyhow!("missing required parameter '{name}'"))?;
    serde_json::from_value(value.clone())
        .map_err(|e| anyhow::anyhow!("invalid parameter '{name}': {e}"))
}

/// Deserialize an optional keyword parameter. `null` counts as absent.
pub fn optional<T: DeserializeOwned>(params: &Params, name: &str) -> anyhow::Result<Option<T>> {
    match params.get(name) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(_) => required(params, name).map(Some),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(value: serde_json::Value) -> Params {
        match value {
            serde_json::Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn envelopes_get_distinct_ids() {
        let a = JobEnvelope::new("double", Params::new());
        let b = JobEnvelope::new("double", Params::new());
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn envelope_into_parts() {
        let env = JobEnvelope::new("double", params(json!({"x": 21})));
        let id = env.id();
        let (got_id, routine, p) = env.into_parts();
        assert_eq!(got_id, id);
        assert_eq!(routine, "double");
        assert_eq!(p["x"], json!(21));
    }

    #[test]
    fn job_id_display_parses_back() {
        let id = JobId::new();
        assert_eq!(JobId::parse(&id.to_string()).unwrap(), id);
        assert!(JobId::parse("not-a-uuid").is_err());
    }

    #[test]
    fn required_param() {
        let p = params(json!({"x": 21, "name": "a"}));
        assert_eq!(required::<i64>(&p, "x").unwrap(), 21);

        let err = required::<i64>(&p, "y").unwrap_err();
        assert_eq!(err.to_string(), "missing required parameter 'y'");

        let err = required::<i64>(&p, "name").unwrap_err();
        assert!(err.to_string().starts_with("invalid parameter 'name'"));
    }

    #[test]
    fn optional_param() {
        let p = params(json!({"x": 2, "n": null}));
        assert_eq!(optional::<i64>(&p, "x").unwrap(), Some(2));
        assert_eq!(optional::<i64>(&p, "n").unwrap(), None);
        assert_eq!(optional::<i64>(&p, "missing").unwrap(), None);
    }
}
