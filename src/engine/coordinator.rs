//! Order assignment state machine.
//!
//! Every operation on an order runs under that order's async mutex, so the
//! accept, decline and timeout paths for one offer are serialized. Across
//! orders the only shared resource is the courier record, which is claimed
//! with [`GeoStore::cas_assign_courier`].
//!
//! The timeout callback re-checks that the order is still offered to the same
//! courier before doing anything. That re-check, not timer cancellation, is
//! what decides an accept/timeout race.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::engine::matcher::DriverMatcher;
use crate::engine::retry::{RetryPolicy, with_backoff};
use crate::engine::timer::{TimeoutScheduler, TimerHandle};
use crate::error::AppError;
use crate::models::event::DispatchEvent;
use crate::models::offer::{Offer, ReleaseReason};
use crate::models::order::{DeliveryOrder, FieldUpdate, OrderFields, OrderStatus};
use crate::notify::NotificationGateway;
use crate::observability::metrics::Metrics;
use crate::store::{Expected, GeoStore, TransitionOutcome};

/// An outstanding offer and the timer that will expire it.
struct InFlightOffer {
    offer: Offer,
    timer: TimerHandle,
}

pub struct AssignmentCoordinator {
    store: Arc<dyn GeoStore>,
    matcher: DriverMatcher,
    scheduler: TimeoutScheduler,
    gateway: Arc<dyn NotificationGateway>,
    metrics: Metrics,
    offer_timeout: Duration,
    retry: RetryPolicy,
    order_locks: DashMap<Uuid, Arc<Mutex<()>>>,
    in_flight: DashMap<Uuid, InFlightOffer>,
}

impl AssignmentCoordinator {
    pub fn new(
        store: Arc<dyn GeoStore>,
        gateway: Arc<dyn NotificationGateway>,
        metrics: Metrics,
        config: &Config,
    ) -> Arc<Self> {
        Arc::new(Self {
            matcher: DriverMatcher::new(store.clone(), config.match_radius_meters),
            store,
            scheduler: TimeoutScheduler::new(),
            gateway,
            metrics,
            offer_timeout: config.offer_timeout(),
            retry: RetryPolicy::from_config(config),
            order_locks: DashMap::new(),
            in_flight: DashMap::new(),
        })
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn active_offers(&self) -> Vec<Offer> {
        self.in_flight
            .iter()
            .map(|entry| entry.value().offer.clone())
            .collect()
    }

    pub async fn get_order(&self, order_id: Uuid) -> Result<DeliveryOrder, AppError> {
        self.load_order(order_id).await
    }

    /// Orders the courier has committed to and not yet delivered.
    pub async fn assigned_orders(&self, courier_id: Uuid) -> Result<Vec<DeliveryOrder>, AppError> {
        self.ensure_courier(courier_id).await?;
        self.store.orders_for_courier(courier_id).await
    }

    /// Matches a `Pending` order and offers it to the nearest eligible courier.
    ///
    /// Returns the order as `Offered`, or as `Exhausted` when nobody is eligible.
    /// Triggering an order that is already `Offered` returns it unchanged.
    pub async fn trigger_assignment(
        self: &Arc<Self>,
        order_id: Uuid,
    ) -> Result<DeliveryOrder, AppError> {
        let _lock = self.lock_order(order_id).await;

        let order = self.load_order(order_id).await?;
        match order.status {
            OrderStatus::Pending => self.assign_locked(order).await,
            OrderStatus::Offered => Ok(order),
            from => Err(self.rejected(AppError::InvalidTransition {
                from,
                to: OrderStatus::Offered,
            })),
        }
    }

    pub async fn courier_accept(
        self: &Arc<Self>,
        order_id: Uuid,
        courier_id: Uuid,
    ) -> Result<DeliveryOrder, AppError> {
        let _lock = self.lock_order(order_id).await;

        let order = self.load_order(order_id).await?;
        self.ensure_courier(courier_id).await?;
        self.check_offer_holder(&order, courier_id, OrderStatus::Accepted)?;

        let accepted = self
            .transition(
                order_id,
                Expected::bound(OrderStatus::Offered, courier_id),
                OrderStatus::Accepted,
                OrderFields {
                    offered_to: FieldUpdate::Clear,
                    assigned_courier: FieldUpdate::Set(courier_id),
                    accepted_at: Some(Utc::now()),
                    ..OrderFields::default()
                },
            )
            .await?;

        self.close_offer(order_id);
        self.metrics
            .offers_total
            .with_label_values(&["accepted"])
            .inc();
        self.metrics
            .assignments_total
            .with_label_values(&["accepted"])
            .inc();
        self.notify_status(&accepted, courier_id);

        info!(order_id = %order_id, courier_id = %courier_id, "offer accepted");
        Ok(accepted)
    }

    /// Records the decline and immediately re-matches against the remaining pool.
    pub async fn courier_decline(
        self: &Arc<Self>,
        order_id: Uuid,
        courier_id: Uuid,
    ) -> Result<DeliveryOrder, AppError> {
        let _lock = self.lock_order(order_id).await;

        let order = self.load_order(order_id).await?;
        self.ensure_courier(courier_id).await?;
        self.check_offer_holder(&order, courier_id, OrderStatus::Pending)?;

        let released = self
            .release_offer(&order, courier_id, ReleaseReason::Declined)
            .await?;
        Ok(self.rematch(released).await)
    }

    pub async fn courier_report_status(
        self: &Arc<Self>,
        order_id: Uuid,
        courier_id: Uuid,
        new_status: OrderStatus,
    ) -> Result<DeliveryOrder, AppError> {
        let _lock = self.lock_order(order_id).await;

        let order = self.load_order(order_id).await?;
        self.ensure_courier(courier_id).await?;

        if order.status.next_reported() != Some(new_status) {
            return Err(self.rejected(AppError::InvalidTransition {
                from: order.status,
                to: new_status,
            }));
        }
        if order.assigned_courier != Some(courier_id) {
            return Err(self.rejected(AppError::NotAssigned {
                order_id,
                courier_id,
            }));
        }

        let delivered = new_status == OrderStatus::Delivered;
        let fields = OrderFields {
            delivered_at: delivered.then(Utc::now),
            ..OrderFields::default()
        };
        let updated = self
            .transition(
                order_id,
                Expected::bound(order.status, courier_id),
                new_status,
                fields,
            )
            .await?;

        if delivered {
            self.free_courier(courier_id, order_id).await;
        }
        self.notify_status(&updated, courier_id);

        info!(
            order_id = %order_id,
            courier_id = %courier_id,
            status = ?new_status,
            "courier reported status"
        );
        Ok(updated)
    }

    /// Administrative cancel from any non-terminal state.
    pub async fn cancel_order(self: &Arc<Self>, order_id: Uuid) -> Result<DeliveryOrder, AppError> {
        let _lock = self.lock_order(order_id).await;

        let order = self.load_order(order_id).await?;
        if order.status.is_terminal() {
            return Err(self.rejected(AppError::InvalidTransition {
                from: order.status,
                to: OrderStatus::Cancelled,
            }));
        }

        let bound = order.bound_courier();
        let cancelled = self
            .transition(
                order_id,
                Expected::of(&order),
                OrderStatus::Cancelled,
                OrderFields {
                    offered_to: FieldUpdate::Clear,
                    assigned_courier: FieldUpdate::Clear,
                    ..OrderFields::default()
                },
            )
            .await?;

        if self.close_offer(order_id).is_some() {
            self.metrics
                .offers_total
                .with_label_values(&[ReleaseReason::Cancelled.as_label()])
                .inc();
        }
        if let Some(courier_id) = bound {
            self.free_courier(courier_id, order_id).await;
            let event = if order.status == OrderStatus::Offered {
                DispatchEvent::OfferWithdrawn {
                    order_id,
                    courier_id,
                    reason: ReleaseReason::Cancelled,
                }
            } else {
                status_event(&cancelled)
            };
            self.gateway.push_to_courier(courier_id, event);
        }
        self.gateway
            .broadcast_to_order_watchers(order_id, status_event(&cancelled));
        self.metrics
            .assignments_total
            .with_label_values(&["cancelled"])
            .inc();

        info!(order_id = %order_id, from = ?order.status, "order cancelled");
        Ok(cancelled)
    }

    /// Timer callback for the offer of `order_id` to `courier_id`.
    ///
    /// Returns `None` when the offer was already resolved, otherwise the order
    /// after re-matching.
    pub async fn expire_offer(
        self: &Arc<Self>,
        order_id: Uuid,
        courier_id: Uuid,
    ) -> Option<DeliveryOrder> {
        let _lock = self.lock_order(order_id).await;

        let store = &self.store;
        let order = match with_backoff(&self.retry, "load expiring order", move || {
            store.get_order(order_id)
        })
        .await
        {
            Ok(Some(order)) => order,
            Ok(None) => {
                warn!(order_id = %order_id, "expired offer for unknown order");
                return None;
            }
            Err(err) => {
                self.stall(order_id, &err);
                return None;
            }
        };

        if order.status != OrderStatus::Offered || order.offered_to != Some(courier_id) {
            debug!(
                order_id = %order_id,
                courier_id = %courier_id,
                status = ?order.status,
                "offer already resolved; timeout ignored"
            );
            return None;
        }

        info!(order_id = %order_id, courier_id = %courier_id, "offer timed out");
        let released = with_backoff(&self.retry, "expire offer", || {
            self.release_offer(&order, courier_id, ReleaseReason::Expired)
        })
        .await;

        match released {
            Ok(released) => Some(self.rematch(released).await),
            Err(AppError::StaleState(reason)) => {
                debug!(order_id = %order_id, %reason, "timeout lost race");
                None
            }
            Err(err) => {
                self.stall(order_id, &err);
                None
            }
        }
    }

    /// One match-and-offer attempt. Caller holds the order lock.
    async fn assign_locked(
        self: &Arc<Self>,
        order: DeliveryOrder,
    ) -> Result<DeliveryOrder, AppError> {
        let started = Instant::now();
        let result = self.match_and_offer(order).await;

        let outcome = match &result {
            Ok(order) if order.status == OrderStatus::Offered => "offered",
            Ok(_) => "exhausted",
            Err(_) => "error",
        };
        self.metrics
            .assignment_latency_seconds
            .with_label_values(&[outcome])
            .observe(started.elapsed().as_secs_f64());

        result
    }

    async fn match_and_offer(
        self: &Arc<Self>,
        order: DeliveryOrder,
    ) -> Result<DeliveryOrder, AppError> {
        let mut exclude: HashSet<Uuid> = order.declined_by.iter().copied().collect();

        loop {
            let Some(candidate) = self
                .matcher
                .find_nearest(&order.restaurant_location, &exclude)
                .await?
            else {
                return self.exhaust(&order).await;
            };
            let courier_id = candidate.courier.id;

            if !self.store.cas_assign_courier(courier_id, order.id).await? {
                debug!(
                    order_id = %order.id,
                    courier_id = %courier_id,
                    "courier claimed by another order; re-matching"
                );
                exclude.insert(courier_id);
                continue;
            }

            let offered = self
                .transition(
                    order.id,
                    Expected::unbound(OrderStatus::Pending),
                    OrderStatus::Offered,
                    OrderFields {
                        offered_to: FieldUpdate::Set(courier_id),
                        ..OrderFields::default()
                    },
                )
                .await;

            return match offered {
                Ok(offered) => {
                    self.open_offer(&offered, courier_id, candidate.distance_m);
                    Ok(offered)
                }
                Err(err) => {
                    self.free_courier(courier_id, order.id).await;
                    Err(err)
                }
            };
        }
    }

    fn open_offer(self: &Arc<Self>, order: &DeliveryOrder, courier_id: Uuid, distance_m: f64) {
        let order_id = order.id;
        let offered_at = Utc::now();
        let ttl = chrono::Duration::from_std(self.offer_timeout)
            .unwrap_or_else(|_| chrono::Duration::days(365));
        let offer = Offer {
            id: Uuid::new_v4(),
            order_id,
            courier_id,
            distance_km: distance_m / 1_000.0,
            offered_at,
            expires_at: offered_at + ttl,
        };

        let coordinator = Arc::clone(self);
        let timer = self.scheduler.arm(self.offer_timeout, move || async move {
            coordinator.expire_offer(order_id, courier_id).await;
        });

        self.in_flight.insert(
            order_id,
            InFlightOffer {
                offer: offer.clone(),
                timer,
            },
        );
        self.metrics.active_offers.set(self.in_flight.len() as i64);
        self.metrics.offers_total.with_label_values(&["made"]).inc();

        info!(
            order_id = %order_id,
            courier_id = %courier_id,
            distance_km = offer.distance_km,
            "offer sent"
        );
        self.gateway
            .push_to_courier(courier_id, DispatchEvent::OfferMade { offer });
        self.gateway
            .broadcast_to_order_watchers(order_id, status_event(order));
    }

    /// Offered -> Pending with `courier_id` added to `declined_by`.
    async fn release_offer(
        self: &Arc<Self>,
        order: &DeliveryOrder,
        courier_id: Uuid,
        reason: ReleaseReason,
    ) -> Result<DeliveryOrder, AppError> {
        let pending = self
            .transition(
                order.id,
                Expected::bound(OrderStatus::Offered, courier_id),
                OrderStatus::Pending,
                OrderFields {
                    offered_to: FieldUpdate::Clear,
                    declined: Some(courier_id),
                    ..OrderFields::default()
                },
            )
            .await?;

        self.close_offer(order.id);
        self.free_courier(courier_id, order.id).await;
        self.metrics
            .offers_total
            .with_label_values(&[reason.as_label()])
            .inc();

        self.gateway.push_to_courier(
            courier_id,
            DispatchEvent::OfferWithdrawn {
                order_id: order.id,
                courier_id,
                reason,
            },
        );
        self.gateway
            .broadcast_to_order_watchers(order.id, status_event(&pending));

        info!(
            order_id = %order.id,
            courier_id = %courier_id,
            reason = reason.as_label(),
            declined = pending.declined_by.len(),
            "offer released"
        );
        Ok(pending)
    }

    /// Re-runs matching after a release. Caller holds the order lock.
    ///
    /// Transient failures hand the order to a background retry so the
    /// courier's decline still succeeds.
    async fn rematch(self: &Arc<Self>, order: DeliveryOrder) -> DeliveryOrder {
        let order_id = order.id;
        match self.assign_locked(order.clone()).await {
            Ok(updated) => updated,
            Err(err) if err.is_retryable() => {
                warn!(order_id = %order_id, error = %err, "re-match failed; retrying in background");
                self.spawn_reassignment(order_id);
                order
            }
            Err(err) => {
                self.stall(order_id, &err);
                order
            }
        }
    }

    fn spawn_reassignment(self: &Arc<Self>, order_id: Uuid) {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            let result = with_backoff(&coordinator.retry, "reassign order", || {
                coordinator.trigger_assignment(order_id)
            })
            .await;
            match result {
                Ok(_) => {}
                Err(err) if err.is_terminal_rejection() => {
                    debug!(order_id = %order_id, error = %err, "order closed before reassignment");
                }
                Err(err) => coordinator.stall(order_id, &err),
            }
        });
    }

    async fn exhaust(&self, order: &DeliveryOrder) -> Result<DeliveryOrder, AppError> {
        let exhausted = self
            .transition(
                order.id,
                Expected::unbound(OrderStatus::Pending),
                OrderStatus::Exhausted,
                OrderFields::default(),
            )
            .await?;

        self.metrics
            .assignments_total
            .with_label_values(&["exhausted"])
            .inc();
        self.gateway.broadcast_to_order_watchers(
            order.id,
            DispatchEvent::AssignmentExhausted {
                order_id: order.id,
                declined_by: exhausted.declined_by.clone(),
            },
        );

        warn!(
            order_id = %order.id,
            declined = exhausted.declined_by.len(),
            "no eligible courier within radius; order exhausted"
        );
        Ok(exhausted)
    }

    /// Surfaces an order that could not be moved forward.
    pub(crate) fn stall(&self, order_id: Uuid, err: &AppError) {
        error!(order_id = %order_id, error = %err, "assignment stalled");
        self.metrics
            .assignments_total
            .with_label_values(&["stalled"])
            .inc();
        self.gateway.broadcast_to_order_watchers(
            order_id,
            DispatchEvent::AssignmentStalled {
                order_id,
                error: err.to_string(),
            },
        );
    }

    fn check_offer_holder(
        &self,
        order: &DeliveryOrder,
        courier_id: Uuid,
        to: OrderStatus,
    ) -> Result<(), AppError> {
        let err = match order.status {
            OrderStatus::Offered if order.offered_to == Some(courier_id) => return Ok(()),
            OrderStatus::Offered => AppError::StaleState(format!(
                "order {} is offered to another courier",
                order.id
            )),
            OrderStatus::Pending | OrderStatus::Exhausted if order.has_declined(courier_id) => {
                AppError::StaleState(format!(
                    "offer of order {} to courier {courier_id} already expired or was declined",
                    order.id
                ))
            }
            from => AppError::InvalidTransition { from, to },
        };
        Err(self.rejected(err))
    }

    async fn transition(
        &self,
        order_id: Uuid,
        expected: Expected,
        target: OrderStatus,
        fields: OrderFields,
    ) -> Result<DeliveryOrder, AppError> {
        match self
            .store
            .apply_order_transition(order_id, expected, target, fields)
            .await?
        {
            Some(TransitionOutcome::Applied(order)) => Ok(order),
            Some(TransitionOutcome::Mismatch(current)) => {
                Err(self.rejected(AppError::StaleState(format!(
                    "order {order_id} is {:?}, expected {:?}",
                    current.status, expected.status
                ))))
            }
            None => Err(AppError::NotFound(format!("order {order_id} not found"))),
        }
    }

    /// Clears the courier's binding to `order_id`.
    async fn release_courier(&self, courier_id: Uuid, order_id: Uuid) -> Result<(), AppError> {
        let store = &self.store;
        let released = with_backoff(&self.retry, "release courier", move || {
            store.cas_release_courier(courier_id, order_id)
        })
        .await?;

        if !released {
            debug!(
                order_id = %order_id,
                courier_id = %courier_id,
                "courier was not bound to order"
            );
        }
        Ok(())
    }

    /// Releases the courier after the order has moved on. A failed release
    /// stalls the order and keeps retrying in the background until the
    /// courier is back in the pool.
    async fn free_courier(self: &Arc<Self>, courier_id: Uuid, order_id: Uuid) {
        if let Err(err) = self.release_courier(courier_id, order_id).await {
            self.stall(order_id, &err);
            self.spawn_release(courier_id, order_id);
        }
    }

    fn spawn_release(self: &Arc<Self>, courier_id: Uuid, order_id: Uuid) {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            let pause = coordinator.retry.delay_for(coordinator.retry.max_attempts);
            loop {
                sleep(pause).await;
                match coordinator.release_courier(courier_id, order_id).await {
                    Ok(()) => {
                        info!(
                            order_id = %order_id,
                            courier_id = %courier_id,
                            "courier released after retry"
                        );
                        return;
                    }
                    Err(err) if err.is_retryable() => {
                        warn!(
                            order_id = %order_id,
                            courier_id = %courier_id,
                            error = %err,
                            "courier release still failing"
                        );
                    }
                    Err(err) => {
                        error!(
                            order_id = %order_id,
                            courier_id = %courier_id,
                            error = %err,
                            "courier release abandoned"
                        );
                        return;
                    }
                }
            }
        });
    }

    fn close_offer(&self, order_id: Uuid) -> Option<Offer> {
        let (_, in_flight) = self.in_flight.remove(&order_id)?;
        self.scheduler.cancel(&in_flight.timer);
        self.metrics.active_offers.set(self.in_flight.len() as i64);
        Some(in_flight.offer)
    }

    fn notify_status(&self, order: &DeliveryOrder, courier_id: Uuid) {
        self.gateway.push_to_courier(courier_id, status_event(order));
        self.gateway
            .broadcast_to_order_watchers(order.id, status_event(order));
    }

    fn rejected(&self, err: AppError) -> AppError {
        self.metrics
            .rejected_transitions_total
            .with_label_values(&[err.kind()])
            .inc();
        err
    }

    async fn load_order(&self, order_id: Uuid) -> Result<DeliveryOrder, AppError> {
        self.store
            .get_order(order_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("order {order_id} not found")))
    }

    async fn ensure_courier(&self, courier_id: Uuid) -> Result<(), AppError> {
        self.store
            .get_courier(courier_id)
            .await?
            .map(|_| ())
            .ok_or_else(|| AppError::NotFound(format!("courier {courier_id} not found")))
    }

    async fn lock_order(&self, order_id: Uuid) -> OrderLock<'_> {
        let lock = self.order_locks.entry(order_id).or_default().clone();
        OrderLock {
            locks: &self.order_locks,
            order_id,
            _guard: lock.lock_owned().await,
        }
    }
}

/// Holds an order's mutex. The map entry is removed on drop once nobody else
/// is waiting for it, so idle and unknown orders leave nothing behind.
struct OrderLock<'a> {
    locks: &'a DashMap<Uuid, Arc<Mutex<()>>>,
    order_id: Uuid,
    _guard: OwnedMutexGuard<()>,
}

impl Drop for OrderLock<'_> {
    fn drop(&mut self) {
        // One reference in the map, one held by our guard.
        self.locks
            .remove_if(&self.order_id, |_, lock| Arc::strong_count(lock) == 2);
    }
}

fn status_event(order: &DeliveryOrder) -> DispatchEvent {
    DispatchEvent::StatusChanged {
        order_id: order.id,
        status: order.status,
        courier_id: order.bound_courier(),
    }
}
