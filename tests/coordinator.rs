use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use courier_dispatch::config::Config;
use courier_dispatch::engine::coordinator::AssignmentCoordinator;
use courier_dispatch::error::AppError;
use courier_dispatch::geo::offset_north;
use courier_dispatch::models::courier::{Courier, GeoPoint};
use courier_dispatch::models::event::DispatchEvent;
use courier_dispatch::models::offer::ReleaseReason;
use courier_dispatch::models::order::{DeliveryOrder, OrderFields, OrderStatus};
use courier_dispatch::notify::{BroadcastGateway, Notification, NotificationTarget};
use courier_dispatch::observability::metrics::Metrics;
use async_trait::async_trait;
use courier_dispatch::store::{Expected, GeoStore, NearbyCourier, TransitionOutcome};
use courier_dispatch::store::memory::InMemoryGeoStore;
use rstest::rstest;
use tokio::sync::broadcast;
use uuid::Uuid;

const RESTAURANT: GeoPoint = GeoPoint {
    lat: 52.52,
    lng: 13.405,
};

struct Harness {
    store: Arc<InMemoryGeoStore>,
    gateway: Arc<BroadcastGateway>,
    coordinator: Arc<AssignmentCoordinator>,
}

impl Harness {
    fn new() -> Self {
        Self::with_config(Config::default())
    }

    fn with_config(config: Config) -> Self {
        let store = Arc::new(InMemoryGeoStore::new());
        let gateway = Arc::new(BroadcastGateway::new(256));
        let coordinator =
            AssignmentCoordinator::new(store.clone(), gateway.clone(), Metrics::new(), &config);
        Self {
            store,
            gateway,
            coordinator,
        }
    }

    async fn courier_at(&self, seed: u128, km: f64) -> Uuid {
        let mut courier = Courier::new(format!("courier-{seed}"), offset_north(&RESTAURANT, km));
        courier.id = Uuid::from_u128(seed);
        self.store.insert_courier(courier).await.unwrap();
        Uuid::from_u128(seed)
    }

    async fn order(&self) -> Uuid {
        let order = DeliveryOrder::new(RESTAURANT);
        let id = order.id;
        self.store.insert_order(order).await.unwrap();
        id
    }

    async fn stored_order(&self, id: Uuid) -> DeliveryOrder {
        self.store.get_order(id).await.unwrap().unwrap()
    }

    async fn stored_courier(&self, id: Uuid) -> Courier {
        self.store.get_courier(id).await.unwrap().unwrap()
    }
}

fn drain(rx: &mut broadcast::Receiver<Notification>) -> Vec<Notification> {
    let mut out = Vec::new();
    while let Ok(notification) = rx.try_recv() {
        out.push(notification);
    }
    out
}

#[tokio::test(start_paused = true)]
async fn decline_then_timeout_exhausts_order() {
    let h = Harness::new();
    let a = h.courier_at(1, 2.0).await;
    let b = h.courier_at(2, 10.0).await;
    let c = h.courier_at(3, 60.0).await;
    let order_id = h.order().await;

    let offered = h.coordinator.trigger_assignment(order_id).await.unwrap();
    assert_eq!(offered.status, OrderStatus::Offered);
    assert_eq!(offered.offered_to, Some(a));
    assert_eq!(h.stored_courier(a).await.assigned_order, Some(order_id));

    let reoffered = h.coordinator.courier_decline(order_id, a).await.unwrap();
    assert_eq!(reoffered.status, OrderStatus::Offered);
    assert_eq!(reoffered.offered_to, Some(b));
    assert_eq!(reoffered.declined_by, vec![a]);
    assert_eq!(h.stored_courier(a).await.assigned_order, None);

    tokio::time::sleep(Duration::from_secs(61)).await;

    let order = h.stored_order(order_id).await;
    assert_eq!(order.status, OrderStatus::Exhausted);
    assert_eq!(order.declined_by, vec![a, b]);
    assert_eq!(order.offered_to, None);
    assert_eq!(h.stored_courier(b).await.assigned_order, None);
    assert_eq!(h.stored_courier(c).await.assigned_order, None);
    assert!(h.coordinator.active_offers().is_empty());
}

#[tokio::test(start_paused = true)]
async fn accept_before_timeout_commits_and_timer_does_nothing() {
    let h = Harness::new();
    let a = h.courier_at(1, 2.0).await;
    let order_id = h.order().await;

    h.coordinator.trigger_assignment(order_id).await.unwrap();
    tokio::time::sleep(Duration::from_secs(30)).await;

    let accepted = h.coordinator.courier_accept(order_id, a).await.unwrap();
    assert_eq!(accepted.status, OrderStatus::Accepted);
    assert_eq!(accepted.assigned_courier, Some(a));
    assert_eq!(accepted.offered_to, None);
    assert!(accepted.accepted_at.is_some());

    tokio::time::sleep(Duration::from_secs(120)).await;

    let order = h.stored_order(order_id).await;
    assert_eq!(order.status, OrderStatus::Accepted);
    assert!(order.declined_by.is_empty());
    assert_eq!(h.stored_courier(a).await.assigned_order, Some(order_id));
}

#[tokio::test(start_paused = true)]
async fn accept_and_timeout_at_same_instant_commit_exactly_once() {
    let h = Harness::new();
    let a = h.courier_at(1, 2.0).await;
    let order_id = h.order().await;

    h.coordinator.trigger_assignment(order_id).await.unwrap();
    tokio::time::sleep(Duration::from_secs(60)).await;
    let accept = h.coordinator.courier_accept(order_id, a).await;
    tokio::task::yield_now().await;

    let order = h.stored_order(order_id).await;
    match accept {
        Ok(_) => {
            assert_eq!(order.status, OrderStatus::Accepted);
            assert!(order.declined_by.is_empty());
        }
        Err(AppError::StaleState(_)) => {
            assert_eq!(order.status, OrderStatus::Exhausted);
            assert_eq!(order.declined_by, vec![a]);
            assert_eq!(order.assigned_courier, None);
        }
        Err(other) => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_accept_and_expiry_never_both_apply() {
    for _ in 0..25 {
        let h = Harness::new();
        let a = h.courier_at(1, 2.0).await;
        let order_id = h.order().await;
        h.coordinator.trigger_assignment(order_id).await.unwrap();

        let accept = tokio::spawn({
            let coordinator = h.coordinator.clone();
            async move { coordinator.courier_accept(order_id, a).await }
        });
        let expire = tokio::spawn({
            let coordinator = h.coordinator.clone();
            async move { coordinator.expire_offer(order_id, a).await }
        });
        let accept = accept.await.unwrap();
        let expire = expire.await.unwrap();

        let order = h.stored_order(order_id).await;
        match (accept, expire) {
            (Ok(accepted), None) => {
                assert_eq!(accepted.status, OrderStatus::Accepted);
                assert_eq!(order.status, OrderStatus::Accepted);
                assert!(!order.has_declined(a));
            }
            (Err(AppError::StaleState(_)), Some(expired)) => {
                assert_eq!(expired.status, OrderStatus::Exhausted);
                assert_eq!(order.declined_by, vec![a]);
                assert_ne!(order.status, OrderStatus::Accepted);
                assert_eq!(h.stored_courier(a).await.assigned_order, None);
            }
            (accept, expire) => panic!("both or neither applied: {accept:?} / {expire:?}"),
        }
    }
}

#[tokio::test]
async fn declined_courier_is_never_reselected() {
    let h = Harness::new();
    let near = h.courier_at(1, 0.5).await;
    let far = h.courier_at(2, 30.0).await;
    let order_id = h.order().await;

    let offered = h.coordinator.trigger_assignment(order_id).await.unwrap();
    assert_eq!(offered.offered_to, Some(near));

    let reoffered = h.coordinator.courier_decline(order_id, near).await.unwrap();
    assert_eq!(reoffered.offered_to, Some(far));

    // The near courier is free and still closest, but excluded for this order.
    assert!(h.stored_courier(near).await.is_eligible());
    let again = h.coordinator.courier_decline(order_id, far).await.unwrap();
    assert_eq!(again.status, OrderStatus::Exhausted);
    assert_eq!(again.declined_by, vec![near, far]);

    let late = h.coordinator.courier_accept(order_id, near).await;
    assert!(matches!(late, Err(AppError::StaleState(_))));
}

#[tokio::test]
async fn declined_by_grows_without_duplicates() {
    let h = Harness::new();
    let a = h.courier_at(1, 1.0).await;
    let b = h.courier_at(2, 2.0).await;
    let order_id = h.order().await;

    h.coordinator.trigger_assignment(order_id).await.unwrap();
    h.coordinator.courier_decline(order_id, a).await.unwrap();

    let repeat = h.coordinator.courier_decline(order_id, a).await;
    assert!(matches!(repeat, Err(AppError::StaleState(_))));
    let order = h.stored_order(order_id).await;
    assert_eq!(order.declined_by, vec![a]);
    assert_eq!(order.offered_to, Some(b));
}

#[tokio::test]
async fn wrong_courier_cannot_answer_offer() {
    let h = Harness::new();
    let a = h.courier_at(1, 1.0).await;
    let b = h.courier_at(2, 2.0).await;
    let order_id = h.order().await;
    h.coordinator.trigger_assignment(order_id).await.unwrap();

    let err = h.coordinator.courier_accept(order_id, b).await.unwrap_err();
    assert!(matches!(err, AppError::StaleState(_)));
    let order = h.stored_order(order_id).await;
    assert_eq!(order.offered_to, Some(a));
    assert_eq!(order.status, OrderStatus::Offered);
}

#[rstest]
#[case(OrderStatus::Preparing)]
#[case(OrderStatus::InDelivery)]
#[case(OrderStatus::Delivered)]
#[tokio::test]
async fn status_reports_from_pending_are_rejected(#[case] reported: OrderStatus) {
    let h = Harness::new();
    let a = h.courier_at(1, 1.0).await;
    let order_id = h.order().await;
    let before = h.stored_order(order_id).await;

    let err = h
        .coordinator
        .courier_report_status(order_id, a, reported)
        .await
        .unwrap_err();

    assert_eq!(
        err,
        AppError::InvalidTransition {
            from: OrderStatus::Pending,
            to: reported,
        }
    );
    let after = h.stored_order(order_id).await;
    assert_eq!(after.status, OrderStatus::Pending);
    assert_eq!(after.updated_at, before.updated_at);
    assert_eq!(h.stored_courier(a).await.assigned_order, None);
}

#[rstest]
#[case(OrderStatus::Delivered)]
#[case(OrderStatus::Accepted)]
#[case(OrderStatus::Cancelled)]
#[tokio::test]
async fn accepted_order_rejects_skipped_statuses(#[case] reported: OrderStatus) {
    let h = Harness::new();
    let a = h.courier_at(1, 1.0).await;
    let order_id = h.order().await;
    h.coordinator.trigger_assignment(order_id).await.unwrap();
    h.coordinator.courier_accept(order_id, a).await.unwrap();

    let err = h
        .coordinator
        .courier_report_status(order_id, a, reported)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidTransition { .. }));
    assert_eq!(h.stored_order(order_id).await.status, OrderStatus::Accepted);
}

#[tokio::test]
async fn declining_accepted_order_is_invalid() {
    let h = Harness::new();
    let a = h.courier_at(1, 1.0).await;
    let order_id = h.order().await;
    h.coordinator.trigger_assignment(order_id).await.unwrap();
    h.coordinator.courier_accept(order_id, a).await.unwrap();

    let err = h.coordinator.courier_decline(order_id, a).await.unwrap_err();
    assert_eq!(
        err,
        AppError::InvalidTransition {
            from: OrderStatus::Accepted,
            to: OrderStatus::Pending,
        }
    );
    let order = h.stored_order(order_id).await;
    assert_eq!(order.status, OrderStatus::Accepted);
    assert!(order.declined_by.is_empty());
}

#[tokio::test]
async fn delivery_chain_frees_courier_for_next_order() {
    let h = Harness::new();
    let a = h.courier_at(1, 1.0).await;
    let order_id = h.order().await;
    h.coordinator.trigger_assignment(order_id).await.unwrap();
    h.coordinator.courier_accept(order_id, a).await.unwrap();

    let assigned = h.coordinator.assigned_orders(a).await.unwrap();
    assert_eq!(assigned.len(), 1);

    for status in [
        OrderStatus::Preparing,
        OrderStatus::InDelivery,
        OrderStatus::Delivered,
    ] {
        let order = h
            .coordinator
            .courier_report_status(order_id, a, status)
            .await
            .unwrap();
        assert_eq!(order.status, status);
    }

    let delivered = h.stored_order(order_id).await;
    assert!(delivered.delivered_at.is_some());
    assert!(h.stored_courier(a).await.is_eligible());
    assert!(h.coordinator.assigned_orders(a).await.unwrap().is_empty());

    let next_order = h.order().await;
    let offered = h.coordinator.trigger_assignment(next_order).await.unwrap();
    assert_eq!(offered.offered_to, Some(a));
}

#[tokio::test]
async fn only_committed_courier_may_report_status() {
    let h = Harness::new();
    let a = h.courier_at(1, 1.0).await;
    let other = h.courier_at(2, 40.0).await;
    let order_id = h.order().await;
    h.coordinator.trigger_assignment(order_id).await.unwrap();
    h.coordinator.courier_accept(order_id, a).await.unwrap();

    let err = h
        .coordinator
        .courier_report_status(order_id, other, OrderStatus::Preparing)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NotAssigned { .. }));
    assert_eq!(h.stored_order(order_id).await.status, OrderStatus::Accepted);
}

#[tokio::test(start_paused = true)]
async fn cancelling_offered_order_releases_courier_and_timer() {
    let h = Harness::new();
    let a = h.courier_at(1, 1.0).await;
    let order_id = h.order().await;
    h.coordinator.trigger_assignment(order_id).await.unwrap();

    let cancelled = h.coordinator.cancel_order(order_id).await.unwrap();
    assert_eq!(cancelled.status, OrderStatus::Cancelled);
    assert_eq!(cancelled.bound_courier(), None);
    assert!(h.stored_courier(a).await.is_eligible());
    assert!(h.coordinator.active_offers().is_empty());

    tokio::time::sleep(Duration::from_secs(90)).await;
    let order = h.stored_order(order_id).await;
    assert_eq!(order.status, OrderStatus::Cancelled);
    assert!(order.declined_by.is_empty());

    let again = h.coordinator.cancel_order(order_id).await.unwrap_err();
    assert!(matches!(again, AppError::InvalidTransition { .. }));
}

#[tokio::test]
async fn cancelling_committed_order_releases_courier() {
    let h = Harness::new();
    let a = h.courier_at(1, 1.0).await;
    let order_id = h.order().await;
    h.coordinator.trigger_assignment(order_id).await.unwrap();
    h.coordinator.courier_accept(order_id, a).await.unwrap();
    h.coordinator
        .courier_report_status(order_id, a, OrderStatus::Preparing)
        .await
        .unwrap();

    h.coordinator.cancel_order(order_id).await.unwrap();
    assert!(h.stored_courier(a).await.is_eligible());

    let err = h
        .coordinator
        .courier_report_status(order_id, a, OrderStatus::InDelivery)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidTransition { .. }));
}

#[tokio::test]
async fn empty_pool_exhausts_and_notifies_watchers() {
    let h = Harness::new();
    h.courier_at(1, 75.0).await;
    let order_id = h.order().await;
    let mut rx = h.gateway.subscribe();

    let order = h.coordinator.trigger_assignment(order_id).await.unwrap();
    assert_eq!(order.status, OrderStatus::Exhausted);

    let events = drain(&mut rx);
    assert!(events.iter().any(|n| {
        n.target == NotificationTarget::Order(order_id)
            && matches!(n.event, DispatchEvent::AssignmentExhausted { .. })
    }));

    let err = h.coordinator.trigger_assignment(order_id).await.unwrap_err();
    assert!(matches!(err, AppError::InvalidTransition { .. }));
}

#[tokio::test]
async fn offer_and_decline_are_pushed_to_courier() {
    let h = Harness::new();
    let a = h.courier_at(1, 1.0).await;
    let order_id = h.order().await;
    let mut rx = h.gateway.subscribe();

    h.coordinator.trigger_assignment(order_id).await.unwrap();
    h.coordinator.courier_decline(order_id, a).await.unwrap();

    let to_courier: Vec<DispatchEvent> = drain(&mut rx)
        .into_iter()
        .filter(|n| n.target == NotificationTarget::Courier(a))
        .map(|n| n.event)
        .collect();

    assert!(matches!(
        to_courier.first(),
        Some(DispatchEvent::OfferMade { offer }) if offer.order_id == order_id
    ));
    assert!(to_courier.iter().any(|event| matches!(
        event,
        DispatchEvent::OfferWithdrawn {
            reason: ReleaseReason::Declined,
            ..
        }
    )));
}

#[tokio::test]
async fn trigger_is_idempotent_while_offered() {
    let h = Harness::new();
    let a = h.courier_at(1, 1.0).await;
    h.courier_at(2, 2.0).await;
    let order_id = h.order().await;

    let first = h.coordinator.trigger_assignment(order_id).await.unwrap();
    let second = h.coordinator.trigger_assignment(order_id).await.unwrap();
    assert_eq!(first.offered_to, Some(a));
    assert_eq!(second.offered_to, Some(a));
    assert_eq!(h.coordinator.active_offers().len(), 1);
}

#[tokio::test]
async fn store_outage_is_retryable_and_mutates_nothing() {
    let h = Harness::new();
    h.courier_at(1, 1.0).await;
    let order_id = h.order().await;

    h.store.set_unavailable(true);
    let err = h.coordinator.trigger_assignment(order_id).await.unwrap_err();
    assert!(err.is_retryable());
    h.store.set_unavailable(false);

    let order = h.stored_order(order_id).await;
    assert_eq!(order.status, OrderStatus::Pending);
    assert_eq!(order.bound_courier(), None);
}

#[tokio::test]
async fn unknown_ids_are_not_found() {
    let h = Harness::new();
    let a = h.courier_at(1, 1.0).await;
    let order_id = h.order().await;

    let missing_order = h
        .coordinator
        .trigger_assignment(Uuid::new_v4())
        .await
        .unwrap_err();
    assert!(matches!(missing_order, AppError::NotFound(_)));

    h.coordinator.trigger_assignment(order_id).await.unwrap();
    let missing_courier = h
        .coordinator
        .courier_accept(order_id, Uuid::new_v4())
        .await
        .unwrap_err();
    assert!(matches!(missing_courier, AppError::NotFound(_)));
    assert_eq!(h.stored_order(order_id).await.offered_to, Some(a));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_orders_never_share_a_courier() {
    let h = Harness::new();
    let only = h.courier_at(1, 1.0).await;
    let first = h.order().await;
    let second = h.order().await;

    let t1 = tokio::spawn({
        let coordinator = h.coordinator.clone();
        async move { coordinator.trigger_assignment(first).await }
    });
    let t2 = tokio::spawn({
        let coordinator = h.coordinator.clone();
        async move { coordinator.trigger_assignment(second).await }
    });
    let r1 = t1.await.unwrap().unwrap();
    let r2 = t2.await.unwrap().unwrap();

    let statuses: HashSet<OrderStatus> = [r1.status, r2.status].into_iter().collect();
    assert_eq!(
        statuses,
        HashSet::from([OrderStatus::Offered, OrderStatus::Exhausted])
    );

    let winner = if r1.status == OrderStatus::Offered { &r1 } else { &r2 };
    assert_eq!(winner.offered_to, Some(only));
    assert_eq!(
        h.stored_courier(only).await.assigned_order,
        Some(winner.id)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn bindings_stay_bijective_under_interleaved_responses() {
    const COURIERS: u128 = 6;
    const ORDERS: usize = 8;

    let h = Harness::new();
    for seed in 1..=COURIERS {
        h.courier_at(seed, seed as f64).await;
    }
    let mut orders = Vec::new();
    for _ in 0..ORDERS {
        orders.push(h.order().await);
    }

    let mut tasks = Vec::new();
    for (i, &order_id) in orders.iter().enumerate() {
        let coordinator = h.coordinator.clone();
        tasks.push(tokio::spawn(async move {
            let _ = coordinator.trigger_assignment(order_id).await;
        }));
        for seed in 1..=COURIERS {
            let coordinator = h.coordinator.clone();
            let courier_id = Uuid::from_u128(seed);
            let action = (i + seed as usize) % 3;
            tasks.push(tokio::spawn(async move {
                match action {
                    0 => {
                        let _ = coordinator.courier_accept(order_id, courier_id).await;
                    }
                    1 => {
                        let _ = coordinator.courier_decline(order_id, courier_id).await;
                    }
                    _ => {
                        coordinator.expire_offer(order_id, courier_id).await;
                    }
                }
            }));
        }
    }
    for task in tasks {
        task.await.unwrap();
    }

    let all_orders = h.store.list_orders().await.unwrap();
    let mut bound_couriers = HashSet::new();
    for order in &all_orders {
        let unique: HashSet<&Uuid> = order.declined_by.iter().collect();
        assert_eq!(unique.len(), order.declined_by.len());
        assert!(order.offered_to.is_none() || order.assigned_courier.is_none());

        if order.status == OrderStatus::Offered || order.status.is_committed() {
            let courier_id = order.bound_courier().unwrap();
            assert!(bound_couriers.insert(courier_id), "courier bound twice");
            assert_eq!(
                h.stored_courier(courier_id).await.assigned_order,
                Some(order.id)
            );
        }
    }

    for courier in h.store.list_couriers().await.unwrap() {
        if let Some(order_id) = courier.assigned_order {
            let order = h.stored_order(order_id).await;
            assert_eq!(order.bound_courier(), Some(courier.id));
        }
    }
}

/// In-memory store with switchable faults on single operations.
#[derive(Default)]
struct FlakyStore {
    inner: InMemoryGeoStore,
    fail_release: AtomicBool,
    fail_matching: AtomicBool,
}

impl FlakyStore {
    fn outage(operation: &str) -> AppError {
        AppError::Retryable(format!("{operation} unavailable"))
    }
}

#[async_trait]
impl GeoStore for FlakyStore {
    async fn insert_order(&self, order: DeliveryOrder) -> Result<(), AppError> {
        self.inner.insert_order(order).await
    }

    async fn get_order(&self, order_id: Uuid) -> Result<Option<DeliveryOrder>, AppError> {
        self.inner.get_order(order_id).await
    }

    async fn list_orders(&self) -> Result<Vec<DeliveryOrder>, AppError> {
        self.inner.list_orders().await
    }

    async fn orders_for_courier(&self, courier_id: Uuid) -> Result<Vec<DeliveryOrder>, AppError> {
        self.inner.orders_for_courier(courier_id).await
    }

    async fn insert_courier(&self, courier: Courier) -> Result<(), AppError> {
        self.inner.insert_courier(courier).await
    }

    async fn get_courier(&self, courier_id: Uuid) -> Result<Option<Courier>, AppError> {
        self.inner.get_courier(courier_id).await
    }

    async fn list_couriers(&self) -> Result<Vec<Courier>, AppError> {
        self.inner.list_couriers().await
    }

    async fn set_courier_availability(
        &self,
        courier_id: Uuid,
        is_available: bool,
    ) -> Result<Option<Courier>, AppError> {
        self.inner
            .set_courier_availability(courier_id, is_available)
            .await
    }

    async fn set_courier_location(
        &self,
        courier_id: Uuid,
        location: GeoPoint,
    ) -> Result<Option<Courier>, AppError> {
        self.inner.set_courier_location(courier_id, location).await
    }

    async fn find_eligible_near(
        &self,
        origin: &GeoPoint,
        radius_m: f64,
        exclude: &HashSet<Uuid>,
    ) -> Result<Vec<NearbyCourier>, AppError> {
        if self.fail_matching.load(Ordering::SeqCst) {
            return Err(Self::outage("find_eligible_near"));
        }
        self.inner.find_eligible_near(origin, radius_m, exclude).await
    }

    async fn cas_assign_courier(&self, courier_id: Uuid, order_id: Uuid) -> Result<bool, AppError> {
        self.inner.cas_assign_courier(courier_id, order_id).await
    }

    async fn cas_release_courier(
        &self,
        courier_id: Uuid,
        order_id: Uuid,
    ) -> Result<bool, AppError> {
        if self.fail_release.load(Ordering::SeqCst) {
            return Err(Self::outage("cas_release_courier"));
        }
        self.inner.cas_release_courier(courier_id, order_id).await
    }

    async fn apply_order_transition(
        &self,
        order_id: Uuid,
        expected: Expected,
        target: OrderStatus,
        fields: OrderFields,
    ) -> Result<Option<TransitionOutcome>, AppError> {
        self.inner
            .apply_order_transition(order_id, expected, target, fields)
            .await
    }
}

struct FlakyHarness {
    store: Arc<FlakyStore>,
    gateway: Arc<BroadcastGateway>,
    coordinator: Arc<AssignmentCoordinator>,
}

impl FlakyHarness {
    fn new() -> Self {
        let store = Arc::new(FlakyStore::default());
        let gateway = Arc::new(BroadcastGateway::new(256));
        let coordinator = AssignmentCoordinator::new(
            store.clone(),
            gateway.clone(),
            Metrics::new(),
            &Config::default(),
        );
        Self {
            store,
            gateway,
            coordinator,
        }
    }

    async fn courier_at(&self, seed: u128, km: f64) -> Uuid {
        let mut courier = Courier::new(format!("courier-{seed}"), offset_north(&RESTAURANT, km));
        courier.id = Uuid::from_u128(seed);
        self.store.insert_courier(courier).await.unwrap();
        Uuid::from_u128(seed)
    }

    async fn order(&self) -> Uuid {
        let order = DeliveryOrder::new(RESTAURANT);
        let id = order.id;
        self.store.insert_order(order).await.unwrap();
        id
    }

    async fn assigned_order_of(&self, courier_id: Uuid) -> Option<Uuid> {
        self.store
            .get_courier(courier_id)
            .await
            .unwrap()
            .unwrap()
            .assigned_order
    }
}

fn stalled_orders(notifications: &[Notification]) -> Vec<Uuid> {
    notifications
        .iter()
        .filter_map(|notification| match &notification.event {
            DispatchEvent::AssignmentStalled { order_id, .. } => Some(*order_id),
            _ => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn failed_release_stalls_order_and_frees_courier_once_store_recovers() {
    let h = FlakyHarness::new();
    let a = h.courier_at(1, 2.0).await;
    let order_id = h.order().await;
    h.coordinator.trigger_assignment(order_id).await.unwrap();
    let mut rx = h.gateway.subscribe();

    h.store.fail_release.store(true, Ordering::SeqCst);
    let declined = h.coordinator.courier_decline(order_id, a).await.unwrap();
    assert_eq!(declined.status, OrderStatus::Exhausted);
    assert_eq!(declined.offered_to, None);
    assert_eq!(h.assigned_order_of(a).await, Some(order_id));
    assert_eq!(stalled_orders(&drain(&mut rx)), vec![order_id]);

    h.store.fail_release.store(false, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(h.assigned_order_of(a).await, None);

    let next = h.order().await;
    let offered = h.coordinator.trigger_assignment(next).await.unwrap();
    assert_eq!(offered.status, OrderStatus::Offered);
    assert_eq!(offered.offered_to, Some(a));
}

#[tokio::test(start_paused = true)]
async fn failed_release_on_cancel_is_retried_in_background() {
    let h = FlakyHarness::new();
    let a = h.courier_at(1, 2.0).await;
    let order_id = h.order().await;
    h.coordinator.trigger_assignment(order_id).await.unwrap();
    h.coordinator.courier_accept(order_id, a).await.unwrap();
    let mut rx = h.gateway.subscribe();

    h.store.fail_release.store(true, Ordering::SeqCst);
    let cancelled = h.coordinator.cancel_order(order_id).await.unwrap();
    assert_eq!(cancelled.status, OrderStatus::Cancelled);
    assert_eq!(stalled_orders(&drain(&mut rx)), vec![order_id]);

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(h.assigned_order_of(a).await, Some(order_id));

    h.store.fail_release.store(false, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(h.assigned_order_of(a).await, None);
}

#[tokio::test(start_paused = true)]
async fn cancel_during_background_rematch_is_not_reported_as_stalled() {
    let h = FlakyHarness::new();
    let a = h.courier_at(1, 2.0).await;
    let b = h.courier_at(2, 10.0).await;
    let order_id = h.order().await;
    h.coordinator.trigger_assignment(order_id).await.unwrap();
    let mut rx = h.gateway.subscribe();

    h.store.fail_matching.store(true, Ordering::SeqCst);
    let declined = h.coordinator.courier_decline(order_id, a).await.unwrap();
    assert_eq!(declined.status, OrderStatus::Pending);

    let cancelled = h.coordinator.cancel_order(order_id).await.unwrap();
    assert_eq!(cancelled.status, OrderStatus::Cancelled);
    h.store.fail_matching.store(false, Ordering::SeqCst);

    tokio::time::sleep(Duration::from_secs(30)).await;

    assert!(stalled_orders(&drain(&mut rx)).is_empty());
    let order = h.coordinator.get_order(order_id).await.unwrap();
    assert_eq!(order.status, OrderStatus::Cancelled);
    assert_eq!(h.assigned_order_of(b).await, None);
}
