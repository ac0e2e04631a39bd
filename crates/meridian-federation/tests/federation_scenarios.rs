//! Multi-cluster job placement, locking and revocation over the memory network.

mod support;

use meridian_federation::FederationError;
use meridian_federation::JobDescription;
use meridian_federation::JobState;
use meridian_federation::MessageHandler;
use meridian_federation::SiblingMask;
use meridian_federation::wire::FederationMessage;
use meridian_federation::wire::FederationReply;
use meridian_federation::wire::JobOutcome;
use meridian_federation::wire::MessageBody;
use support::TestFederation;
use support::WAIT;
use support::cid;
use support::descriptor;
use support::wait_for;

fn restricted_to(names: &[&str]) -> JobDescription {
    JobDescription {
        name: "scenario".into(),
        clusters: Some(names.iter().map(|name| name.to_string()).collect()),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_submission_replicates_to_viable_siblings_only() {
    let fed = TestFederation::start(&[1, 2, 3]);

    let outcome = fed.manager(1).submit_job(restricted_to(&["c1", "c2"])).await.unwrap();
    let viable: SiblingMask = [cid(1), cid(2)].into_iter().collect();
    assert_eq!(outcome.viable, viable);
    assert_eq!(outcome.active, viable);
    assert!(outcome.runnable_locally);

    let job_id = outcome.job_id;
    assert!(wait_for(WAIT, || fed.manager(2).job(job_id).is_some()).await, "c2 never received its copy");
    assert!(fed.manager(3).job(job_id).is_none());
    assert_eq!(fed.manager(2).job_metadata(job_id).unwrap().origin(), cid(1));

    // An origin outside the viable set only tracks the job.
    let remote = fed.manager(3).submit_job(restricted_to(&["c1", "c2"])).await.unwrap();
    assert!(!remote.runnable_locally);
    assert!(fed.manager(3).job(remote.job_id).unwrap().tracking_only);
    assert!(
        wait_for(WAIT, || {
            fed.manager(1).job(remote.job_id).is_some() && fed.manager(2).job(remote.job_id).is_some()
        })
        .await
    );

    fed.shutdown().await;
}

#[tokio::test]
async fn test_sibling_start_takes_lock_from_origin() {
    let fed = TestFederation::start(&[1, 2, 3]);
    let job_id = fed.manager(1).submit_job(JobDescription::default()).await.unwrap().job_id;
    assert!(
        wait_for(WAIT, || fed.manager(2).job(job_id).is_some() && fed.manager(3).job(job_id).is_some()).await
    );

    fed.manager(2).job_start(job_id).await.unwrap();
    assert_eq!(fed.manager(1).job_metadata(job_id).unwrap().cluster_lock(), Some(cid(2)));

    // Neither the origin nor another sibling can take the lock now.
    let err = fed.manager(1).locks().acquire(job_id).await.unwrap_err();
    assert!(matches!(err, FederationError::LockHeld { holder, .. } if holder == cid(2)), "{err}");
    let reply = fed.manager(1).locks().handle_lock_request(job_id, cid(3));
    assert!(matches!(reply, FederationReply::LockDenied { holder: Some(holder), .. } if holder == cid(2)));

    // The origin learns of the start and the third copy is revoked.
    assert!(wait_for(WAIT, || fed.manager(3).job(job_id).is_none()).await, "c3 copy was never revoked");
    assert!(
        wait_for(WAIT, || {
            fed.manager(1).job(job_id).is_some_and(|job| job.revoked && job.running_cluster == Some(cid(2)))
        })
        .await
    );
    assert_eq!(fed.manager(1).job_metadata(job_id).unwrap().active(), SiblingMask::single(cid(2)));

    fed.shutdown().await;
}

#[tokio::test]
async fn test_origin_start_revokes_every_sibling_copy() {
    let fed = TestFederation::start(&[1, 2, 3]);
    let job_id = fed.manager(1).submit_job(JobDescription::default()).await.unwrap().job_id;
    assert!(
        wait_for(WAIT, || fed.manager(2).job(job_id).is_some() && fed.manager(3).job(job_id).is_some()).await
    );

    fed.manager(1).job_start(job_id).await.unwrap();
    assert!(
        wait_for(WAIT, || fed.manager(2).job(job_id).is_none() && fed.manager(3).job(job_id).is_none()).await,
        "sibling copies survived the origin start"
    );
    let record = fed.manager(1).job(job_id).unwrap();
    assert_eq!(record.state, JobState::Running);
    assert!(!record.revoked);

    fed.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_starts_have_one_winner() {
    let fed = TestFederation::start(&[1, 2, 3]);
    let job_id = fed.manager(1).submit_job(JobDescription::default()).await.unwrap().job_id;
    assert!(
        wait_for(WAIT, || fed.manager(2).job(job_id).is_some() && fed.manager(3).job(job_id).is_some()).await
    );

    let (a, b) = tokio::join!(fed.manager(2).job_start(job_id), fed.manager(3).job_start(job_id));
    assert_eq!(a.is_ok() as u8 + b.is_ok() as u8, 1, "a={a:?} b={b:?}");

    let winner = if a.is_ok() { cid(2) } else { cid(3) };
    assert_eq!(fed.manager(1).job_metadata(job_id).unwrap().cluster_lock(), Some(winner));

    fed.shutdown().await;
}

#[tokio::test]
async fn test_sibling_completion_reaches_origin() {
    let fed = TestFederation::start(&[1, 2]);
    let job_id = fed.manager(1).submit_job(JobDescription::default()).await.unwrap().job_id;
    assert!(wait_for(WAIT, || fed.manager(2).job(job_id).is_some()).await);

    fed.manager(2).job_start(job_id).await.unwrap();
    fed.manager(2).job_complete(job_id, JobState::Completed, 3).unwrap();
    assert!(fed.manager(2).job_metadata(job_id).is_none());

    assert!(
        wait_for(WAIT, || fed.manager(1).job(job_id).is_some_and(|job| job.state == JobState::Completed)).await,
        "origin never saw the completion"
    );
    let record = fed.manager(1).job(job_id).unwrap();
    assert_eq!(record.exit_code, 3);
    assert_eq!(record.running_cluster, Some(cid(2)));
    let meta = fed.manager(1).job_metadata(job_id).unwrap();
    assert_eq!(meta.cluster_lock(), None);
    assert!(meta.active().is_empty());

    fed.shutdown().await;
}

#[tokio::test]
async fn test_revoke_applied_twice_is_harmless() {
    let fed = TestFederation::start(&[1, 2]);
    let job_id = fed.manager(1).submit_job(JobDescription::default()).await.unwrap().job_id;
    assert!(wait_for(WAIT, || fed.manager(2).job(job_id).is_some()).await);

    let revoke = MessageBody::JobRevoke(JobOutcome {
        job_id,
        state: JobState::Cancelled,
        return_code: 0,
        start_time_ms: 0,
    });
    for _ in 0..2 {
        let reply = fed.manager(2).handle_message(FederationMessage::new(cid(1), revoke.clone())).await;
        assert_eq!(reply, FederationReply::Ack);
    }

    assert!(wait_for(WAIT, || fed.manager(2).job(job_id).is_none() && fed.manager(2).pending_updates() == 0).await);
    assert!(fed.manager(2).job_metadata(job_id).is_none());

    fed.shutdown().await;
}

#[tokio::test]
async fn test_membership_change_narrows_viable_sets() {
    let fed = TestFederation::start(&[1, 2, 3]);
    let job_id = fed.manager(1).submit_job(JobDescription::default()).await.unwrap().job_id;

    let change = fed.manager(1).apply_membership(descriptor(&[1, 2])).unwrap();
    assert_eq!(change.removed, vec![cid(3)]);

    let meta = fed.manager(1).job_metadata(job_id).unwrap();
    let expected: SiblingMask = [cid(1), cid(2)].into_iter().collect();
    assert_eq!(meta.viable(), expected);
    assert!(!meta.active().contains(cid(3)));
    assert_eq!(fed.manager(1).clusters().len(), 2);
    assert!(fed.manager(1).sibling_by_name("c3").is_err());

    fed.shutdown().await;
}
