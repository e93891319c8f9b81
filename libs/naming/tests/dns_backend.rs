use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use discovery::{HostResolver, ResolveError};
use naming::{
    DiscoveryError, DnsNamingService, DnsSettings, Endpoint, Listener, NamingService, Operation,
    RegisterInfo, SubscribeInfo,
};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::sleep;

type Change = (Vec<Endpoint>, Vec<Endpoint>);

const INTERVAL: Duration = Duration::from_millis(100);

/// Resolver answering with whatever the test last set; `None` fails.
#[derive(Debug, Default)]
struct Scripted {
    answer: Mutex<Option<Vec<IpAddr>>>,
}

impl Scripted {
    fn set(&self, addrs: &[&str]) {
        *self.answer.lock() = Some(addrs.iter().map(|a| a.parse().unwrap()).collect());
    }

    fn fail(&self) {
        *self.answer.lock() = None;
    }
}

#[async_trait]
impl HostResolver for Scripted {
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>, ResolveError> {
        self.answer
            .lock()
            .clone()
            .ok_or_else(|| ResolveError::NoRecords(host.to_owned()))
    }
}

fn service(resolver: &Arc<Scripted>) -> DnsNamingService {
    let settings = DnsSettings {
        host: "svc.example".into(),
        port: 8080,
        interval: INTERVAL,
    };
    DnsNamingService::with_resolver(
        "dns://svc.example:8080".into(),
        settings,
        Arc::clone(resolver) as Arc<dyn HostResolver>,
    )
}

fn collector() -> (Listener, mpsc::UnboundedReceiver<Change>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let listener: Listener = Arc::new(move |added: &[Endpoint], removed: &[Endpoint]| {
        let _ = tx.send((added.to_vec(), removed.to_vec()));
    });
    (listener, rx)
}

fn ep(addr: &str) -> Endpoint {
    Endpoint::new(addr, 8080)
}

#[tokio::test]
async fn lookup_resolves_every_address_on_the_configured_port() {
    let resolver = Arc::new(Scripted::default());
    resolver.set(&["10.0.0.1", "10.0.0.2", "10.0.0.1"]);
    let naming = service(&resolver);

    let found = naming.lookup(&SubscribeInfo::new("any")).await.unwrap();
    assert_eq!(found, vec![ep("10.0.0.1"), ep("10.0.0.2")]);
    // lookup does not move the subscription baseline
    assert!(naming.last_endpoints().is_empty());
    assert_eq!(naming.host_port(), "svc.example:8080");
}

#[tokio::test]
async fn lookup_failure_is_always_reported() {
    let resolver = Arc::new(Scripted::default());
    let naming = service(&resolver);

    for info in [
        SubscribeInfo::new("any"),
        SubscribeInfo::new("any").ignore_failure(true),
    ] {
        let err = naming.lookup(&info).await.unwrap_err();
        assert_eq!(err.failed_operation(), Some(Operation::Lookup));
    }
}

#[tokio::test(start_paused = true)]
async fn refresh_reports_set_difference() {
    let resolver = Arc::new(Scripted::default());
    resolver.set(&["10.0.0.1", "10.0.0.2"]);
    let naming = service(&resolver);
    let (listener, mut rx) = collector();
    naming.subscribe(&SubscribeInfo::new("any"), listener).await.unwrap();

    // nothing before the first tick
    sleep(INTERVAL / 2).await;
    assert!(rx.try_recv().is_err());

    sleep(INTERVAL).await;
    assert_eq!(
        rx.try_recv().unwrap(),
        (vec![ep("10.0.0.1"), ep("10.0.0.2")], vec![])
    );

    resolver.set(&["10.0.0.2", "10.0.0.3"]);
    sleep(INTERVAL).await;
    assert_eq!(rx.try_recv().unwrap(), (vec![ep("10.0.0.3")], vec![ep("10.0.0.1")]));
    assert!(rx.try_recv().is_err());
    assert_eq!(naming.last_endpoints(), vec![ep("10.0.0.2"), ep("10.0.0.3")]);

    // an unchanged answer is still reported
    sleep(INTERVAL).await;
    assert_eq!(rx.try_recv().unwrap(), (vec![], vec![]));
    naming.close().await;
}

#[tokio::test(start_paused = true)]
async fn failed_refresh_keeps_previous_snapshot() {
    let resolver = Arc::new(Scripted::default());
    resolver.set(&["10.0.0.1"]);
    let naming = service(&resolver);
    let (listener, mut rx) = collector();
    naming.subscribe(&SubscribeInfo::new("any"), listener).await.unwrap();
    sleep(INTERVAL + INTERVAL / 2).await;
    assert_eq!(rx.try_recv().unwrap().0, vec![ep("10.0.0.1")]);

    resolver.fail();
    sleep(INTERVAL * 2).await;
    assert!(rx.try_recv().is_err());
    assert_eq!(naming.last_endpoints(), vec![ep("10.0.0.1")]);

    // refreshing resumes after failures
    resolver.set(&["10.0.0.2"]);
    sleep(INTERVAL).await;
    assert_eq!(rx.try_recv().unwrap(), (vec![ep("10.0.0.2")], vec![ep("10.0.0.1")]));
    naming.close().await;
}

#[tokio::test(start_paused = true)]
async fn one_subscription_per_backend() {
    let resolver = Arc::new(Scripted::default());
    resolver.set(&["10.0.0.1"]);
    let naming = service(&resolver);
    let (listener, mut rx) = collector();
    let info = SubscribeInfo::new("any");

    naming.subscribe(&info, Arc::clone(&listener)).await.unwrap();
    // same target again is a no-op
    naming.subscribe(&info, Arc::clone(&listener)).await.unwrap();
    let err = naming
        .subscribe(&SubscribeInfo::new("other"), listener)
        .await
        .unwrap_err();
    assert!(matches!(err, DiscoveryError::Config(_)));

    sleep(INTERVAL + INTERVAL / 2).await;
    assert!(rx.try_recv().is_ok());
    assert!(rx.try_recv().is_err());
    naming.close().await;
}

#[tokio::test(start_paused = true)]
async fn unsubscribe_stops_refreshing() {
    let resolver = Arc::new(Scripted::default());
    resolver.set(&["10.0.0.1"]);
    let naming = service(&resolver);
    let (listener, mut rx) = collector();
    let info = SubscribeInfo::new("any");
    naming.subscribe(&info, listener).await.unwrap();

    // a different target leaves the subscription alone
    naming.unsubscribe(&SubscribeInfo::new("other")).await.unwrap();
    assert!(naming.is_subscribed());

    naming.unsubscribe(&info).await.unwrap();
    assert!(!naming.is_subscribed());
    sleep(INTERVAL * 5).await;
    assert!(rx.try_recv().is_err());

    // free for a new subscription
    let (listener, _rx) = collector();
    naming.subscribe(&SubscribeInfo::new("other"), listener).await.unwrap();
    naming.close().await;
    assert!(!naming.is_subscribed());
}

#[tokio::test]
async fn register_and_unregister_do_nothing() {
    let resolver = Arc::new(Scripted::default());
    let naming = service(&resolver);
    let info = RegisterInfo::new("any", "10.0.0.9", 80);
    naming.register(&info).await.unwrap();
    naming.unregister(&info).await.unwrap();
    assert_eq!(naming.backend(), "dns://svc.example:8080");
}
