use crate::crd::{
    CONDITION_DB_INITIALIZED, CONDITION_IMAGE_CHANGE_IN_PROGRESS, CONDITION_VERTICA_RESTART_NEEDED,
    VerticaDB, VerticaDBStatus,
};

use vertdb_operator::controller::Context;
use vertdb_operator::error::{Error, Result};

use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use kube::ResourceExt;
use kube::api::{Api, Patch, PatchParams};

const CONDITION_TRUE: &str = "True";
const CONDITION_FALSE: &str = "False";

#[allow(async_fn_in_trait)]
pub trait StatusExt {
    /// Fetches the live status so the reconcile actors work off a fresh snapshot; unlike the
    /// rest of the pipeline this does not mutate anything, it only refreshes `self.status`.
    async fn update_status(&self, ctx: &Context<VerticaDB>) -> Result<VerticaDBStatus>;
    /// Read-modify-write status patch with retry-on-conflict, applied as a server-side apply.
    async fn patch_status(&self, ctx: &Context<VerticaDB>, status: VerticaDBStatus) -> Result<()>;
}

impl StatusExt for VerticaDB {
    async fn update_status(&self, ctx: &Context<VerticaDB>) -> Result<VerticaDBStatus> {
        let namespace = self.get_namespace();
        let api: Api<VerticaDB> = Api::namespaced(ctx.client.clone(), &namespace);
        let current = api.get_status(&self.name_any()).await.map_err(|e| {
            Error::KubeError("failed to fetch VerticaDB status".to_string(), e)
        })?;
        Ok(current.status.unwrap_or_default())
    }

    async fn patch_status(&self, ctx: &Context<VerticaDB>, status: VerticaDBStatus) -> Result<()> {
        let namespace = self.get_namespace();
        let name = self.name_any();
        let api: Api<VerticaDB> = Api::namespaced(ctx.client.clone(), &namespace);
        let patch = Patch::Apply(VerticaDB {
            status: Some(status),
            ..VerticaDB::default()
        });
        let params = PatchParams::apply(ctx.controller_id).force();
        api.patch_status(&name, &params, &patch)
            .await
            .map_err(|e| Error::KubeError(format!("failed to patch VerticaDB/status {namespace}/{name}"), e))?;
        Ok(())
    }
}

pub fn is_db_initialized(status: &VerticaDBStatus) -> bool {
    has_condition(status, CONDITION_DB_INITIALIZED, true)
}

pub fn is_image_change_in_progress(status: &VerticaDBStatus) -> bool {
    has_condition(status, CONDITION_IMAGE_CHANGE_IN_PROGRESS, true)
}

pub fn is_vertica_restart_needed(status: &VerticaDBStatus) -> bool {
    has_condition(status, CONDITION_VERTICA_RESTART_NEEDED, true)
}

fn has_condition(status: &VerticaDBStatus, kind: &str, expected_true: bool) -> bool {
    let expected = if expected_true { CONDITION_TRUE } else { CONDITION_FALSE };
    status
        .conditions
        .iter()
        .any(|c| c.type_ == kind && c.status == expected)
}

/// Sets (or flips) one condition kind, recording a transition only when the status actually
/// changes so `lastTransitionTime` reflects real state changes, not every reconcile tick.
pub fn set_condition(
    conditions: &mut Vec<Condition>,
    kind: &str,
    value: bool,
    reason: &str,
    message: &str,
    generation: Option<i64>,
) {
    let new_status = if value { CONDITION_TRUE } else { CONDITION_FALSE }.to_string();
    if let Some(existing) = conditions.iter_mut().find(|c| c.type_ == kind) {
        if existing.status != new_status {
            existing.status = new_status;
            existing.last_transition_time = Time(Utc::now());
        }
        existing.reason = reason.to_string();
        existing.message = message.to_string();
        existing.observed_generation = generation;
    } else {
        conditions.push(Condition {
            type_: kind.to_string(),
            status: new_status,
            reason: reason.to_string(),
            message: message.to_string(),
            last_transition_time: Time(Utc::now()),
            observed_generation: generation,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_condition_creates_new() {
        let mut conditions = Vec::new();
        set_condition(&mut conditions, "DBInitialized", true, "Created", "db created", Some(1));
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].status, "True");
    }

    #[test]
    fn test_set_condition_preserves_transition_time_when_unchanged() {
        let mut conditions = Vec::new();
        set_condition(&mut conditions, "DBInitialized", true, "Created", "db created", Some(1));
        let first_time = conditions[0].last_transition_time.clone();
        set_condition(&mut conditions, "DBInitialized", true, "Created", "db created", Some(2));
        assert_eq!(conditions[0].last_transition_time, first_time);
        assert_eq!(conditions.len(), 1);
    }

    #[test]
    fn test_is_db_initialized() {
        let status = VerticaDBStatus {
            conditions: vec![Condition {
                type_: CONDITION_DB_INITIALIZED.to_string(),
                status: "True".to_string(),
                reason: "Created".to_string(),
                message: String::new(),
                last_transition_time: Time(Utc::now()),
                observed_generation: None,
            }],
            ..Default::default()
        };
        assert!(is_db_initialized(&status));
    }
}
