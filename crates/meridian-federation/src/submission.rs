//! Submission routing.
//!
//! The origin computes the viable siblings of a new job from its cluster
//! filter, partition, feature expression and array flag, records the local
//! copy and replicates the job to every other viable sibling. Siblings that
//! accept a copy are marked active; the rest are left out until the next
//! resubmission.

use std::sync::Arc;

use futures::future::join_all;
use tracing::debug;
use tracing::info;
use tracing::instrument;
use tracing::warn;

use crate::constants::PROTOCOL_VERSION;
use crate::context::FederationContext;
use crate::error::ArrayJobNotFederatedSnafu;
use crate::error::ClusterNotAcceptingSnafu;
use crate::error::InvalidClusterNameSnafu;
use crate::error::InvalidFeatureExpressionSnafu;
use crate::error::JobExistsSnafu;
use crate::error::NoViableClusterSnafu;
use crate::error::Result;
use crate::job_store::DependencyStatus;
use crate::job_store::JobDescription;
use crate::job_store::JobRecord;
use crate::pure::features::apply_feature_expression;
use crate::pure::features::parse_feature_expression;
use crate::types::ClusterId;
use crate::types::FederationMetadata;
use crate::types::JobId;
use crate::types::SiblingMask;
use crate::types::now_unix_ms;
use crate::wire::MessageBody;
use crate::wire::SubmitSibling;
use crate::wire::decode_job;
use crate::wire::encode_job;

/// Result of a federated submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitOutcome {
    pub job_id: JobId,
    pub viable: SiblingMask,
    /// Clusters holding a live copy after replication.
    pub active: SiblingMask,
    /// The origin copy may be scheduled locally.
    pub runnable_locally: bool,
}

/// Places new jobs on siblings and accepts copies from other origins.
#[derive(Debug)]
pub struct SubmissionRouter {
    ctx: Arc<FederationContext>,
}

impl SubmissionRouter {
    pub fn new(ctx: Arc<FederationContext>) -> Self {
        Self { ctx }
    }

    /// Clusters allowed to run `description`.
    pub fn compute_viable(&self, description: &JobDescription) -> Result<SiblingMask> {
        let federation = &self.ctx.federation;
        let local = self.ctx.local_id();

        let mut candidates = match description.clusters.as_deref() {
            Some(names) if !names.is_empty() => {
                federation.mask_for_names(names).map_err(|name| InvalidClusterNameSnafu { name }.build())?
            }
            _ => federation.member_mask(),
        };

        candidates = candidates.intersection(federation.schedulable_mask());
        if candidates.is_empty() {
            return NoViableClusterSnafu {
                reason: "no requested cluster is accepting jobs",
            }
            .fail();
        }

        if let Some(partition) = description.partition.as_deref() {
            candidates = candidates.intersection(federation.clusters_offering_partition(partition));
            if candidates.is_empty() {
                return NoViableClusterSnafu {
                    reason: format!("no requested cluster offers partition '{partition}'"),
                }
                .fail();
            }
        }

        if let Some(expression) = description.cluster_features.as_deref() {
            let parsed = parse_feature_expression(expression)
                .map_err(|reason| InvalidFeatureExpressionSnafu { expression, reason }.build())?;
            candidates = apply_feature_expression(&parsed, candidates, |feature| federation.clusters_with_feature(feature))
                .map_err(|rejection| {
                    NoViableClusterSnafu {
                        reason: rejection.to_string(),
                    }
                    .build()
                })?;
        }

        if description.is_array {
            if !candidates.contains(local) {
                return ArrayJobNotFederatedSnafu.fail();
            }
            candidates = SiblingMask::single(local);
        }

        Ok(candidates)
    }

    /// Submit a new job with the local cluster as origin.
    #[instrument(skip(self, description), fields(name = %description.name))]
    pub async fn submit(&self, description: JobDescription) -> Result<SubmitOutcome> {
        let local = self.ctx.local_id();
        let viable = self.compute_viable(&description)?;
        let job_id = self.ctx.jobs.allocate_job_id()?;
        let now_ms = now_unix_ms();

        let runnable_locally = viable.contains(local);
        let mut record = JobRecord::new(job_id, description.clone(), now_ms);
        record.federated = true;
        record.tracking_only = !runnable_locally;
        if description.dependency.is_some() {
            record.dependency = DependencyStatus::Waiting;
        }
        self.ctx.jobs.insert(record)?;

        let mut meta = FederationMetadata::new(local, viable, now_ms);
        if runnable_locally {
            meta.add_active(local);
        }
        meta.standalone = viable == SiblingMask::single(local);
        self.ctx.index.insert(job_id, meta);

        let active = if viable.without(local).is_empty() {
            SiblingMask::single(local)
        } else {
            self.replicate(job_id, &description).await?
        };

        info!(%job_id, %viable, %active, "federated job submitted");
        Ok(SubmitOutcome {
            job_id,
            viable,
            active,
            runnable_locally,
        })
    }

    /// Send the job to every viable sibling; returns the resulting active set.
    ///
    /// Each blob is encoded for the target's protocol version. Consecutive
    /// targets speaking the same version share one encoding.
    pub async fn replicate(&self, job_id: JobId, description: &JobDescription) -> Result<SiblingMask> {
        let local = self.ctx.local_id();
        let meta = self.ctx.metadata(job_id)?;
        let targets = meta.viable().without(local);
        let offered_active = meta.viable();

        let mut requests = Vec::new();
        let mut cached: Option<(u16, Vec<u8>)> = None;
        for target in targets.iter() {
            let version = self
                .ctx
                .federation
                .cluster(target)
                .map(|cluster| cluster.protocol_version.min(PROTOCOL_VERSION))
                .unwrap_or(PROTOCOL_VERSION);
            let blob = match &cached {
                Some((cached_version, blob)) if *cached_version == version => blob.clone(),
                _ => {
                    let blob = encode_job(description, version)?;
                    cached = Some((version, blob.clone()));
                    blob
                }
            };
            let submit = SubmitSibling {
                job_id,
                job_blob: blob,
                blob_version: version,
                submitting_cluster: local,
                interactive: false,
                viable: meta.viable().bits(),
                active: offered_active.bits(),
                submit_time_ms: meta.submit_time_ms,
            };
            requests.push((target, submit));
        }

        let results = join_all(requests.into_iter().map(|(target, submit)| async move {
            let result = self.ctx.connections.call(target, MessageBody::SubmitSibling(submit)).await;
            (target, result)
        }))
        .await;

        let mut accepted = Vec::new();
        for (target, result) in results {
            match result {
                Ok(_) => accepted.push(target),
                Err(err) => warn!(%job_id, cluster = %target, error = %err, "sibling submission failed"),
            }
        }

        let active = self
            .ctx
            .index
            .update(job_id, |meta| {
                for target in &accepted {
                    meta.add_active(*target);
                }
                for target in targets.iter().filter(|t| !accepted.contains(t)) {
                    meta.remove_active(target);
                }
                meta.active()
            })
            .unwrap_or_default();
        Ok(active)
    }

    /// Quick checks run before a sibling submission is queued.
    pub fn validate_sibling_submit(&self, sender: ClusterId, submit: &SubmitSibling) -> Result<()> {
        let local = self.ctx.federation.local_cluster();
        if let Some(local) = local {
            if !local.state.accepts_new_jobs() {
                return ClusterNotAcceptingSnafu { name: local.name }.fail();
            }
        }
        if let Some(existing) = self.ctx.index.get(submit.job_id) {
            if existing.origin() != sender {
                return JobExistsSnafu { job_id: submit.job_id }.fail();
            }
        }
        Ok(())
    }

    /// Create or refresh the local copy of a job submitted by `sender`.
    pub fn apply_sibling_submit(&self, sender: ClusterId, submit: SubmitSibling) -> Result<()> {
        self.validate_sibling_submit(sender, &submit)?;
        let job_id = submit.job_id;
        let local = self.ctx.local_id();
        let description = decode_job(&submit.job_blob, submit.blob_version)?;

        let mut meta = FederationMetadata::new(sender, SiblingMask::from_bits(submit.viable), submit.submit_time_ms);
        meta.set_active(SiblingMask::from_bits(submit.active));
        meta.add_active(local);

        let mut record = JobRecord::new(job_id, description, submit.submit_time_ms);
        record.federated = true;
        if record.description.dependency.is_some() {
            record.dependency = DependencyStatus::Waiting;
        }

        // A resubmission after requeue replaces a stale copy.
        if let Some(previous) = self.ctx.jobs.purge(job_id) {
            debug!(%job_id, state = %previous.state, "replacing existing sibling copy");
        }
        self.ctx.jobs.insert(record)?;
        self.ctx.index.insert(job_id, meta);
        info!(%job_id, origin = %sender, "sibling copy created");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounting::StaticAccountingProbe;
    use crate::error::FederationError;
    use crate::testing::cid;
    use crate::testing::context_with;
    use crate::testing::descriptor;
    use crate::transport::memory::MemoryNetwork;
    use crate::types::ClusterState;

    fn router(local: u32) -> (Arc<FederationContext>, SubmissionRouter) {
        let network = MemoryNetwork::new();
        let mut federation = descriptor(&[1, 2, 3]);
        federation.clusters[0] = federation.clusters[0].clone().with_features(["gpu"]).with_partitions(["batch"]);
        federation.clusters[1] = federation.clusters[1].clone().with_features(["gpu", "fast"]);
        federation.clusters[2] = federation.clusters[2].clone().with_partitions(["debug"]);
        let ctx = context_with(&network, federation, local, Arc::new(StaticAccountingProbe::default()));
        let router = SubmissionRouter::new(ctx.clone());
        (ctx, router)
    }

    fn mask(ids: &[u32]) -> SiblingMask {
        ids.iter().map(|id| cid(*id)).collect()
    }

    #[test]
    fn test_viable_from_filters() {
        let (_, router) = router(1);
        assert_eq!(router.compute_viable(&JobDescription::default()).unwrap(), mask(&[1, 2, 3]));

        let filtered = JobDescription {
            clusters: Some(vec!["c1".into(), "c3".into()]),
            ..Default::default()
        };
        assert_eq!(router.compute_viable(&filtered).unwrap(), mask(&[1, 3]));

        let features = JobDescription {
            cluster_features: Some("gpu&!fast".into()),
            ..Default::default()
        };
        assert_eq!(router.compute_viable(&features).unwrap(), mask(&[1]));
    }

    #[test]
    fn test_viable_rejections() {
        let (ctx, router) = router(1);
        let unknown = JobDescription {
            clusters: Some(vec!["nope".into()]),
            ..Default::default()
        };
        assert!(matches!(router.compute_viable(&unknown), Err(FederationError::InvalidClusterName { .. })));

        let bad = JobDescription {
            cluster_features: Some("gpu|!fast".into()),
            ..Default::default()
        };
        assert!(matches!(router.compute_viable(&bad), Err(FederationError::InvalidFeatureExpression { .. })));

        let impossible = JobDescription {
            cluster_features: Some("tpu".into()),
            ..Default::default()
        };
        assert!(matches!(router.compute_viable(&impossible), Err(FederationError::NoViableCluster { .. })));

        ctx.federation.set_cluster_state(cid(3), ClusterState::Draining).unwrap();
        let only_drained = JobDescription {
            clusters: Some(vec!["c3".into()]),
            ..Default::default()
        };
        assert!(matches!(router.compute_viable(&only_drained), Err(FederationError::NoViableCluster { .. })));
    }

    #[test]
    fn test_array_jobs_stay_local() {
        let (_, router) = router(1);
        let array = JobDescription {
            is_array: true,
            ..Default::default()
        };
        assert_eq!(router.compute_viable(&array).unwrap(), mask(&[1]));

        let elsewhere = JobDescription {
            is_array: true,
            clusters: Some(vec!["c2".into()]),
            ..Default::default()
        };
        assert!(matches!(router.compute_viable(&elsewhere), Err(FederationError::ArrayJobNotFederated)));
    }

    #[tokio::test]
    async fn test_submit_with_unreachable_siblings() {
        let (ctx, router) = router(1);
        let outcome = router.submit(JobDescription::default()).await.unwrap();
        assert_eq!(outcome.job_id.origin(), Some(cid(1)));
        assert_eq!(outcome.viable, mask(&[1, 2, 3]));
        // Nobody is listening, so only the origin copy is active.
        assert_eq!(outcome.active, mask(&[1]));
        assert!(outcome.runnable_locally);
        assert!(ctx.jobs.get(outcome.job_id).unwrap().is_runnable());
    }

    #[tokio::test]
    async fn test_origin_not_viable_keeps_tracking_record() {
        let (ctx, router) = router(1);
        let description = JobDescription {
            clusters: Some(vec!["c2".into()]),
            ..Default::default()
        };
        let outcome = router.submit(description).await.unwrap();
        assert!(!outcome.runnable_locally);
        let record = ctx.jobs.get(outcome.job_id).unwrap();
        assert!(record.tracking_only);
        assert!(!record.is_runnable());
    }

    #[test]
    fn test_apply_sibling_submit() {
        let (ctx, router) = router(2);
        let job_id = JobId::new(cid(1), 9).unwrap();
        let description = JobDescription {
            name: "remote".into(),
            dependency: Some("afterok:5".into()),
            ..Default::default()
        };
        let submit = SubmitSibling {
            job_id,
            job_blob: encode_job(&description, 1).unwrap(),
            blob_version: 1,
            submitting_cluster: cid(1),
            interactive: false,
            viable: mask(&[1, 2]).bits(),
            active: mask(&[1, 2]).bits(),
            submit_time_ms: 10,
        };
        router.apply_sibling_submit(cid(1), submit.clone()).unwrap();

        let record = ctx.jobs.get(job_id).unwrap();
        assert_eq!(record.description.name, "remote");
        // Version 1 blobs carry no dependency.
        assert_eq!(record.dependency, DependencyStatus::None);
        let meta = ctx.index.get(job_id).unwrap();
        assert_eq!(meta.origin(), cid(1));
        assert!(meta.active().contains(cid(2)));

        // Same job claimed by a different origin is refused.
        assert!(router.validate_sibling_submit(cid(3), &submit).is_err());

        ctx.federation.set_cluster_state(cid(2), ClusterState::Draining).unwrap();
        assert!(matches!(
            router.validate_sibling_submit(cid(1), &submit),
            Err(FederationError::ClusterNotAccepting { .. })
        ));
    }
}
