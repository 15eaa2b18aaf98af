// /////////////////////////////////////////////////////////////////////////////
// Experiment Runner
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Request Envelope
//!
//! The typed form of a queue message: one experiment, its artifact manifest,
//! its resource needs, and the per-task configuration (project identity,
//! credentials environment, extra interpreter packages).
//!
//! ## Determinism
//!
//! The envelope serializes deterministically: struct fields emit in
//! declaration order and the artifact/env mappings are `BTreeMap`s, so two
//! equal requests always produce byte-identical JSON. The scheduler relies
//! on this for [`Request::digest`], which names scrape documents and
//! deduplicates retries.
//!
//! ## Credentials
//!
//! Storage credentials are taken only from `config.env`, never from the
//! worker's own process environment. Per-task isolation is the point: two
//! experiments on one host may belong to different tenants.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::entities::artifact::Artifact;
use crate::error::RunnerError;
use crate::value_objects::resource::Resource;

/// Serde adapter for `"2h"`-style humanized durations.
pub(crate) mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let text = String::deserialize(deserializer)?;
        humantime::parse_duration(&text).map_err(serde::de::Error::custom)
    }
}

/// The experiment half of the envelope: what to run and what it needs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Experiment {
    /// Unique key within the project; names the scrape directory
    #[serde(default)]
    pub key: String,

    /// Entry-point filename, launched inside the prepared environment
    #[serde(default)]
    pub filename: String,

    /// Ordered command arguments passed to the entry point
    #[serde(default)]
    pub args: Vec<String>,

    /// Role name to artifact reference; `workspace` is conventionally the
    /// code tree, `output` the writable results archive
    #[serde(default)]
    pub artifacts: BTreeMap<String, Artifact>,

    /// Resource needs matched against the host ledger before leasing
    #[serde(default)]
    pub resources_needed: Resource,

    /// Wall-clock budget for the child process
    #[serde(default, with = "duration_str")]
    pub max_duration: Duration,

    /// Interpreter packages installed into the isolated environment
    #[serde(default, rename = "pythonenv")]
    pub python_env: Vec<String>,
}

/// Project reference inside the per-task configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectRef {
    #[serde(default, rename = "projectId")]
    pub project_id: String,
}

/// The configuration half of the envelope.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestConfig {
    /// Project identity; the GPU affinity group derives from this
    #[serde(default)]
    pub database: ProjectRef,

    /// Per-task environment, including storage credentials
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Additional interpreter packages appended after the experiment's own
    #[serde(default)]
    pub pip: Vec<String>,
}

/// One queue message, fully typed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub experiment: Experiment,
    pub config: RequestConfig,
}

impl Request {
    /// Unmarshals a queue message body.
    pub fn try_from_json(body: &[u8]) -> Result<Self, RunnerError> {
        let request: Request = serde_json::from_slice(body)
            .map_err(|e| RunnerError::invalid_request(format!("unparseable request: {}", e)))?;
        request.validate()?;
        Ok(request)
    }

    /// Deterministic serialized form, used for digests and response payloads.
    pub fn canonical_json(&self) -> Result<String, RunnerError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Hex SHA-256 over the canonical form.
    pub fn digest(&self) -> Result<String, RunnerError> {
        let mut hasher = Sha256::new();
        hasher.update(self.canonical_json()?.as_bytes());
        Ok(hex::encode(hasher.finalize()))
    }

    /// Owning project id, empty when the payload carried none.
    pub fn project_id(&self) -> &str {
        &self.config.database.project_id
    }

    /// GPU affinity group. Sequential requests from one project bias onto
    /// the same cards; an empty project yields the experiment key so a
    /// card is never bound to the empty group.
    pub fn group(&self) -> &str {
        if self.project_id().is_empty() {
            &self.experiment.key
        } else {
            self.project_id()
        }
    }

    /// Validates the envelope invariants before any resources are touched.
    pub fn validate(&self) -> Result<(), RunnerError> {
        if self.experiment.key.is_empty() {
            return Err(RunnerError::invalid_request("experiment key is empty"));
        }
        if self.experiment.filename.is_empty() {
            return Err(RunnerError::invalid_request("entry-point filename is empty"));
        }
        for (role, artifact) in &self.experiment.artifacts {
            artifact.validate(role)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WIRE_EXAMPLE: &str = r#"{
      "experiment": { "key": "exp-123", "filename": "train.py", "args": ["--epochs","2"],
                      "artifacts": { "workspace": {"qualified":"s3://bkt/ws.tgz","mutable":false,"unpack":true,"bucket":"bkt","key":"ws.tgz"},
                                     "output":    {"qualified":"s3://bkt/out.tgz","mutable":true,"unpack":false,"bucket":"bkt","key":"out.tgz"} },
                      "resources_needed": {"cpus":2,"gpus":1,"hdd":"10gb","ram":"2gb","gpuMem":"8gb"},
                      "max_duration":"2h", "pythonenv":["numpy==1.24"] },
      "config":     { "database":{"projectId":"demo"}, "env":{"AWS_ACCESS_KEY_ID":"AK","AWS_SECRET_ACCESS_KEY":"SK"}, "pip":["requests"] }
    }"#;

    #[test]
    fn test_wire_example_parses() {
        let req = Request::try_from_json(WIRE_EXAMPLE.as_bytes()).unwrap();
        assert_eq!(req.experiment.key, "exp-123");
        assert_eq!(req.experiment.filename, "train.py");
        assert_eq!(req.experiment.args, vec!["--epochs", "2"]);
        assert_eq!(req.experiment.artifacts.len(), 2);
        assert!(req.experiment.artifacts["workspace"].unpack);
        assert!(req.experiment.artifacts["output"].mutable);
        assert_eq!(req.experiment.resources_needed.cpus, 2);
        assert_eq!(req.experiment.resources_needed.gpu_mem, 8_000_000_000);
        assert_eq!(req.experiment.max_duration, Duration::from_secs(2 * 3600));
        assert_eq!(req.experiment.python_env, vec!["numpy==1.24"]);
        assert_eq!(req.project_id(), "demo");
        assert_eq!(req.config.env["AWS_ACCESS_KEY_ID"], "AK");
        assert_eq!(req.config.pip, vec!["requests"]);
    }

    #[test]
    fn test_digest_is_stable_across_key_order() {
        let req1 = Request::try_from_json(WIRE_EXAMPLE.as_bytes()).unwrap();
        // Same payload with artifact roles swapped in source order
        let swapped = WIRE_EXAMPLE.replace(
            r#""workspace": {"qualified":"s3://bkt/ws.tgz","mutable":false,"unpack":true,"bucket":"bkt","key":"ws.tgz"},"#,
            "",
        );
        let swapped = swapped.replace(
            r#""output":    {"qualified":"s3://bkt/out.tgz","mutable":true,"unpack":false,"bucket":"bkt","key":"out.tgz"} }"#,
            r#""output":    {"qualified":"s3://bkt/out.tgz","mutable":true,"unpack":false,"bucket":"bkt","key":"out.tgz"},
               "workspace": {"qualified":"s3://bkt/ws.tgz","mutable":false,"unpack":true,"bucket":"bkt","key":"ws.tgz"} }"#,
        );
        let req2 = Request::try_from_json(swapped.as_bytes()).unwrap();
        assert_eq!(req1.digest().unwrap(), req2.digest().unwrap());
    }

    #[test]
    fn test_bad_json_is_invalid_request() {
        let err = Request::try_from_json(b"{not json").unwrap_err();
        assert!(err.is_bad_request());
    }

    #[test]
    fn test_missing_key_rejected() {
        let err = Request::try_from_json(br#"{"experiment":{"filename":"a.py"},"config":{}}"#)
            .unwrap_err();
        assert!(matches!(err, RunnerError::InvalidRequest(_)));
    }

    #[test]
    fn test_group_falls_back_to_experiment_key() {
        let mut req = Request::try_from_json(WIRE_EXAMPLE.as_bytes()).unwrap();
        assert_eq!(req.group(), "demo");
        req.config.database.project_id.clear();
        assert_eq!(req.group(), "exp-123");
    }
}
