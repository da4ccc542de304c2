// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Provenance ledger: which code actually ran during the job.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::job::JobParams;

/// One executed module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    /// Module name.
    pub name: String,
    /// Module version.
    pub ver: String,
    /// Source repository.
    pub code_url: String,
    /// Commit hash.
    pub commit: String,
}

/// Ordered, de-duplicated list of actions plus the root call description.
#[derive(Debug, Clone)]
pub struct Provenance {
    root: Value,
    subactions: Vec<Action>,
}

impl Provenance {
    /// Start a ledger for the top-level job.
    pub fn new(params: &JobParams) -> Self {
        let (service, method) = params
            .method
            .split_once('.')
            .unwrap_or((params.method.as_str(), ""));
        let root = json!({
            "time": Utc::now().to_rfc3339_opts(SecondsFormat::Secs, false),
            "service": service,
            "service_ver": params.service_ver,
            "method": method,
            "method_params": params.params,
            "input_ws_objects": [],
            "description": "KBase SDK method run via the KBase Execution Engine",
        });
        Self {
            root,
            subactions: Vec::new(),
        }
    }

    /// Record an action. A second action for the same module is ignored.
    pub fn add_subaction(&mut self, action: Action) -> bool {
        if self.subactions.iter().any(|a| a.name == action.name) {
            return false;
        }
        self.subactions.push(action);
        true
    }

    /// Recorded actions in insertion order.
    pub fn subactions(&self) -> &[Action] {
        &self.subactions
    }

    /// Snapshot as served by `get_provenance`: a one-element list.
    pub fn snapshot(&self) -> Value {
        let mut prov = self.root.clone();
        prov["subactions"] = json!(self.subactions);
        json!([prov])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn action(name: &str, ver: &str) -> Action {
        Action {
            name: name.to_string(),
            ver: ver.to_string(),
            code_url: format!("https://github.com/kbaseapps/{}", name),
            commit: "abcdef".to_string(),
        }
    }

    #[test]
    fn test_one_action_per_module() {
        let mut params = JobParams::new("echo_test.echo", json!([{"message": "hi"}]));
        params.service_ver = Some("0.0.1".to_string());
        let mut prov = Provenance::new(&params);

        assert!(prov.add_subaction(action("echo_test", "0.0.1")));
        assert!(prov.add_subaction(action("RAST_SDK", "1.0")));
        assert!(!prov.add_subaction(action("echo_test", "9.9.9")));

        let names: Vec<_> = prov.subactions().iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, ["echo_test", "RAST_SDK"]);
        assert_eq!(prov.subactions()[0].ver, "0.0.1");
    }

    #[test]
    fn test_snapshot_shape() {
        let params = JobParams::new("echo_test.echo", json!([1]));
        let mut prov = Provenance::new(&params);
        prov.add_subaction(action("echo_test", "0.0.1"));

        let snapshot = prov.snapshot();
        let entry = &snapshot[0];
        assert_eq!(snapshot.as_array().unwrap().len(), 1);
        assert_eq!(entry["service"], "echo_test");
        assert_eq!(entry["method"], "echo");
        assert_eq!(entry["method_params"], json!([1]));
        assert_eq!(entry["subactions"][0]["name"], "echo_test");
    }
}
