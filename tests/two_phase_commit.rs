//! Distributed two-phase commit: local resources through their proxy
//! pools, a remote domain as an external resource through the gateway,
//! prepare-before-commit ordering observed at every participant, and the
//! rollback legs.

mod common;

use std::sync::Arc;
use std::time::Duration;

use casual::configuration::{InboundGroup, Model, OutboundConnection, OutboundGroup, Resource};
use casual::domain_types::{InstanceOrder, ResourceId};
use casual::runtime::Builder;
use casual::server::{Entry, Invocation};
use casual::transaction::proxy::{Behavior, Journal, Phase, WellBehaved};
use casual::xa::XaCode;

use common::{free_address, service, shutdown};

/// A service that enrolls the domain's first configured resource
fn enrolling(name: &str) -> Entry {
    Entry::new(
        casual::message::service::Service::named(service(name)),
        |invocation: Invocation| async move {
            if let Some(trid) = invocation.trid {
                invocation.api.involve(trid, &[ResourceId::new(1)]);
            }
            Ok(invocation.payload)
        },
    )
}

fn with_resource(mut model: Model, name: &str) -> Model {
    model.transaction.resources.push(Resource {
        name: name.into(),
        instances: 1,
    });
    model
}

#[tokio::test(flavor = "multi_thread")]
async fn local_commit_drives_prepare_then_commit() {
    let journal = Journal::new();
    let model = with_resource(Model::named("local-2pc"), "rm-one");
    let domain = Builder::new(model)
        .with_server("enrolling-server", vec![enrolling("work")])
        .with_resource("rm-one", Arc::new(WellBehaved), Some(Arc::clone(&journal)))
        .boot()
        .await
        .expect("domain boots");

    let mut session = domain.session().await.expect("session connects");
    let trid = session.begin().expect("transaction begins");
    let reply = session
        .call(&service("work"), b"payload".to_vec())
        .await
        .expect("call completes");
    assert!(reply.is_ok());

    let outcome = session.commit().await.expect("commit completes");
    assert_eq!(outcome, XaCode::Ok);

    // single resource: commit-one-phase, no separate prepare
    let phases = journal.phases(trid);
    assert_eq!(phases, vec![Phase::Commit]);

    shutdown(domain).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn two_local_resources_prepare_before_commit() {
    let first = Journal::new();
    let second = Journal::new();
    let mut model = with_resource(Model::named("two-rm"), "rm-one");
    model.transaction.resources.push(Resource {
        name: "rm-two".into(),
        instances: 1,
    });

    let both = Entry::new(
        casual::message::service::Service::named(service("both")),
        |invocation: Invocation| async move {
            if let Some(trid) = invocation.trid {
                invocation
                    .api
                    .involve(trid, &[ResourceId::new(1), ResourceId::new(2)]);
            }
            Ok(Vec::new())
        },
    );

    let domain = Builder::new(model)
        .with_server("both-server", vec![both])
        .with_resource("rm-one", Arc::new(WellBehaved), Some(Arc::clone(&first)))
        .with_resource("rm-two", Arc::new(WellBehaved), Some(Arc::clone(&second)))
        .boot()
        .await
        .expect("domain boots");

    let mut session = domain.session().await.expect("session connects");
    let trid = session.begin().expect("transaction begins");
    let reply = session.call(&service("both"), Vec::new()).await.expect("call completes");
    assert!(reply.is_ok());
    assert_eq!(session.commit().await.expect("commit completes"), XaCode::Ok);

    for journal in [&first, &second] {
        assert_eq!(
            journal.phases(trid),
            vec![Phase::Prepare, Phase::Commit],
            "each resource observes exactly one prepare then one commit"
        );
    }

    shutdown(domain).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn commit_across_domains_reaches_both_resources() {
    let address = free_address();
    let local_journal = Journal::new();
    let remote_journal = Journal::new();

    // remote domain: inbound gateway, a resource, and a service enrolling it
    let mut remote_model = with_resource(Model::named("remote-2pc"), "rm-remote");
    remote_model.gateway.inbound.push(InboundGroup {
        listener: Some(address.clone()),
        connect: Vec::new(),
    });
    let remote = Builder::new(remote_model)
        .with_server("remote-server", vec![enrolling("remote/work")])
        .with_resource(
            "rm-remote",
            Arc::new(WellBehaved),
            Some(Arc::clone(&remote_journal)),
        )
        .boot()
        .await
        .expect("remote domain boots");

    // local domain: outbound gateway, a resource, and a service enrolling it
    let mut local_model = with_resource(Model::named("local-2pc"), "rm-local");
    local_model.gateway.outbound.push(OutboundGroup {
        order: InstanceOrder::default(),
        connections: vec![OutboundConnection {
            address: address.clone(),
            services: Vec::new(),
            queues: Vec::new(),
        }],
        reconnect: true,
        reverse: false,
        listener: None,
    });
    let local = Builder::new(local_model)
        .with_server("local-server", vec![enrolling("local/work")])
        .with_resource(
            "rm-local",
            Arc::new(WellBehaved),
            Some(Arc::clone(&local_journal)),
        )
        .boot()
        .await
        .expect("local domain boots");

    tokio::time::sleep(Duration::from_millis(300)).await;

    let mut session = local.session().await.expect("session connects");
    session.set_timeout(Duration::from_secs(5));
    let trid = session.begin().expect("transaction begins");

    let reply = session
        .call(&service("local/work"), Vec::new())
        .await
        .expect("local call completes");
    assert!(reply.is_ok());

    let reply = session
        .call(&service("remote/work"), Vec::new())
        .await
        .expect("remote call completes");
    assert!(reply.is_ok());

    let outcome = session.commit().await.expect("commit completes");
    assert_eq!(outcome, XaCode::Ok);

    // a moment for the remote commit leg to land in the journal
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(
        local_journal.phases(trid),
        vec![Phase::Prepare, Phase::Commit],
        "the local resource observes prepare then commit"
    );
    // the XID crosses the wire unchanged, so the remote journal records the
    // very same transaction
    assert_eq!(
        remote_journal.phases(trid),
        vec![Phase::Prepare, Phase::Commit],
        "the remote resource observes prepare then commit under the same XID"
    );

    shutdown(local).await;
    shutdown(remote).await;
}

/// A resource that refuses to prepare
#[derive(Debug)]
struct RefusesPrepare;

impl Behavior for RefusesPrepare {
    fn prepare(&self, _trid: casual::domain_types::Xid) -> XaCode {
        XaCode::RollbackUnspecified
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_prepare_rolls_the_yes_voters_back() {
    let healthy = Journal::new();
    let refusing = Journal::new();
    let mut model = with_resource(Model::named("mixed-votes"), "rm-good");
    model.transaction.resources.push(Resource {
        name: "rm-bad".into(),
        instances: 1,
    });

    let both = Entry::new(
        casual::message::service::Service::named(service("mixed")),
        |invocation: Invocation| async move {
            if let Some(trid) = invocation.trid {
                invocation
                    .api
                    .involve(trid, &[ResourceId::new(1), ResourceId::new(2)]);
            }
            Ok(Vec::new())
        },
    );

    let domain = Builder::new(model)
        .with_server("mixed-server", vec![both])
        .with_resource("rm-good", Arc::new(WellBehaved), Some(Arc::clone(&healthy)))
        .with_resource("rm-bad", Arc::new(RefusesPrepare), Some(Arc::clone(&refusing)))
        .boot()
        .await
        .expect("domain boots");

    let mut session = domain.session().await.expect("session connects");
    let trid = session.begin().expect("transaction begins");
    let reply = session.call(&service("mixed"), Vec::new()).await.expect("call completes");
    assert!(reply.is_ok());

    let outcome = session.commit().await.expect("commit completes");
    assert_ne!(outcome, XaCode::Ok, "a no-vote must surface to the owner");

    tokio::time::sleep(Duration::from_millis(200)).await;
    let healthy_phases = healthy.phases(trid);
    assert_eq!(
        healthy_phases,
        vec![Phase::Prepare, Phase::Rollback],
        "the yes-voter is rolled back after the mixed vote"
    );
    assert_eq!(refusing.phases(trid), vec![Phase::Prepare]);

    shutdown(domain).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn read_only_commit_touches_no_resource() {
    let journal = Journal::new();
    let model = with_resource(Model::named("read-only"), "rm-idle");
    let domain = Builder::new(model)
        .with_resource("rm-idle", Arc::new(WellBehaved), Some(Arc::clone(&journal)))
        .boot()
        .await
        .expect("domain boots");

    let mut session = domain.session().await.expect("session connects");
    let _ = session.begin().expect("transaction begins");
    let outcome = session.commit().await.expect("commit completes");
    assert_eq!(outcome, XaCode::ReadOnly);
    assert!(journal.observations().is_empty());

    shutdown(domain).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn rollback_reaches_every_involved_resource() {
    let journal = Journal::new();
    let model = with_resource(Model::named("rollback"), "rm-one");
    let domain = Builder::new(model)
        .with_server("enrolling-server", vec![enrolling("work")])
        .with_resource("rm-one", Arc::new(WellBehaved), Some(Arc::clone(&journal)))
        .boot()
        .await
        .expect("domain boots");

    let mut session = domain.session().await.expect("session connects");
    let trid = session.begin().expect("transaction begins");
    let reply = session.call(&service("work"), Vec::new()).await.expect("call completes");
    assert!(reply.is_ok());

    let outcome = session.rollback().await.expect("rollback completes");
    assert_eq!(outcome, XaCode::Ok);
    assert_eq!(journal.phases(trid), vec![Phase::Rollback]);

    shutdown(domain).await;
}
