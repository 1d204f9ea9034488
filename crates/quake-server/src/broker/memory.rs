//! In-process broker
//!
//! Same delivery contract as the PostgreSQL broker, for the `standalone`
//! role and for tests. Messages do not survive a restart.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::warn;

use super::{dead_letter_queue, BrokerError, BrokerSettings, Delivery, MessageBroker};

#[derive(Debug, Clone)]
struct StoredMessage {
    id: i64,
    payload: serde_json::Value,
    delivery_count: i32,
}

#[derive(Debug)]
struct InFlight {
    queue: String,
    message: StoredMessage,
    visible_at: Instant,
}

#[derive(Debug, Default)]
struct BrokerState {
    next_id: i64,
    queues: HashMap<String, VecDeque<StoredMessage>>,
    in_flight: HashMap<i64, InFlight>,
}

impl BrokerState {
    /// Return expired in-flight messages of `queue` to the front of the line
    fn release_expired(&mut self, queue: &str, now: Instant) {
        let mut expired: Vec<i64> = self
            .in_flight
            .iter()
            .filter(|(_, f)| f.queue == queue && f.visible_at <= now)
            .map(|(id, _)| *id)
            .collect();
        expired.sort_unstable_by(|a, b| b.cmp(a));

        for id in expired {
            if let Some(flight) = self.in_flight.remove(&id) {
                self.queues.entry(flight.queue).or_default().push_front(flight.message);
            }
        }
    }

    fn next_expiry(&self, queue: &str) -> Option<Instant> {
        self.in_flight
            .values()
            .filter(|f| f.queue == queue)
            .map(|f| f.visible_at)
            .min()
    }
}

pub struct InMemoryBroker {
    state: Mutex<BrokerState>,
    notify: Notify,
    settings: BrokerSettings,
}

impl InMemoryBroker {
    pub fn new(settings: BrokerSettings) -> Self {
        Self {
            state: Mutex::new(BrokerState::default()),
            notify: Notify::new(),
            settings,
        }
    }

    /// Messages waiting in `queue`, excluding in-flight ones
    pub async fn pending(&self, queue: &str) -> usize {
        self.state.lock().await.queues.get(queue).map_or(0, VecDeque::len)
    }

    /// Claimed messages of `queue` not yet acknowledged
    pub async fn in_flight(&self, queue: &str) -> usize {
        self.state.lock().await.in_flight.values().filter(|f| f.queue == queue).count()
    }

    /// Payloads that were moved to the dead-letter queue of `queue`
    pub async fn dead_letters(&self, queue: &str) -> Vec<serde_json::Value> {
        let state = self.state.lock().await;
        state
            .queues
            .get(&dead_letter_queue(queue))
            .map(|q| q.iter().map(|m| m.payload.clone()).collect())
            .unwrap_or_default()
    }

    async fn try_claim(&self, queue: &str) -> (Option<Delivery>, Option<Instant>) {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        state.release_expired(queue, now);

        loop {
            let Some(mut message) = state.queues.get_mut(queue).and_then(VecDeque::pop_front) else {
                return (None, state.next_expiry(queue));
            };

            message.delivery_count += 1;
            if message.delivery_count > self.settings.max_deliveries {
                warn!(
                    queue = %queue,
                    message_id = message.id,
                    deliveries = message.delivery_count - 1,
                    "Message exceeded max deliveries, moving to dead-letter queue"
                );
                message.delivery_count = 0;
                state.queues.entry(dead_letter_queue(queue)).or_default().push_back(message);
                continue;
            }

            let delivery = Delivery {
                id: message.id,
                queue: queue.to_string(),
                payload: message.payload.clone(),
                delivery_count: message.delivery_count,
            };
            state.in_flight.insert(
                message.id,
                InFlight {
                    queue: queue.to_string(),
                    message,
                    visible_at: now + self.settings.visibility_timeout,
                },
            );
            return (Some(delivery), None);
        }
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new(BrokerSettings::default())
    }
}

#[async_trait]
impl MessageBroker for InMemoryBroker {
    async fn publish(&self, queue: &str, payload: serde_json::Value) -> Result<(), BrokerError> {
        {
            let mut state = self.state.lock().await;
            state.next_id += 1;
            let id = state.next_id;
            state.queues.entry(queue.to_string()).or_default().push_back(StoredMessage {
                id,
                payload,
                delivery_count: 0,
            });
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn receive(&self, queue: &str, wait: Duration) -> Result<Option<Delivery>, BrokerError> {
        let deadline = Instant::now() + wait;

        loop {
            // Register interest before looking so a publish in between is not missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let (delivery, next_expiry) = self.try_claim(queue).await;
            if delivery.is_some() {
                return Ok(delivery);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let wake_at = next_expiry.map_or(deadline, |expiry| expiry.min(deadline));

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn extend(&self, delivery: &Delivery, visibility: Duration) -> Result<bool, BrokerError> {
        let mut state = self.state.lock().await;
        match state.in_flight.get_mut(&delivery.id) {
            Some(flight) if flight.message.delivery_count == delivery.delivery_count => {
                flight.visible_at = Instant::now() + visibility;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        self.state.lock().await.in_flight.remove(&delivery.id);
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        {
            let mut state = self.state.lock().await;
            if let Some(flight) = state.in_flight.remove(&delivery.id) {
                state.queues.entry(flight.queue).or_default().push_front(flight.message);
            }
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn ping(&self) -> Result<(), BrokerError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn broker(visibility_secs: u64, max_deliveries: i32) -> InMemoryBroker {
        InMemoryBroker::new(BrokerSettings {
            visibility_timeout: Duration::from_secs(visibility_secs),
            max_deliveries,
            poll_interval: Duration::from_millis(10),
        })
    }

    #[tokio::test]
    async fn test_fifo_and_ack() {
        let broker = broker(30, 5);
        broker.publish("q", json!(1)).await.unwrap();
        broker.publish("q", json!(2)).await.unwrap();

        let first = broker.receive("q", Duration::ZERO).await.unwrap().unwrap();
        let second = broker.receive("q", Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(first.payload, json!(1));
        assert_eq!(second.payload, json!(2));
        assert_eq!(first.delivery_count, 1);

        broker.ack(&first).await.unwrap();
        broker.ack(&second).await.unwrap();
        assert!(broker.receive("q", Duration::ZERO).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unacked_message_is_redelivered_after_visibility_timeout() {
        let broker = broker(30, 5);
        broker.publish("q", json!("work")).await.unwrap();

        let claimed = broker.receive("q", Duration::ZERO).await.unwrap().unwrap();
        assert!(broker.receive("q", Duration::from_secs(10)).await.unwrap().is_none());

        let again = broker.receive("q", Duration::from_secs(60)).await.unwrap().unwrap();
        assert_eq!(again.id, claimed.id);
        assert_eq!(again.delivery_count, 2);
    }

    #[tokio::test]
    async fn test_nack_makes_message_visible_immediately() {
        let broker = broker(300, 5);
        broker.publish("q", json!("work")).await.unwrap();

        let claimed = broker.receive("q", Duration::ZERO).await.unwrap().unwrap();
        broker.nack(&claimed).await.unwrap();
        let again = broker.receive("q", Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(again.id, claimed.id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_extend_keeps_message_hidden() {
        let broker = broker(30, 5);
        broker.publish("q", json!("slow")).await.unwrap();
        let claimed = broker.receive("q", Duration::ZERO).await.unwrap().unwrap();

        for _ in 0..4 {
            tokio::time::advance(Duration::from_secs(20)).await;
            assert!(broker.extend(&claimed, Duration::from_secs(30)).await.unwrap());
            assert!(broker.receive("q", Duration::ZERO).await.unwrap().is_none());
        }

        broker.ack(&claimed).await.unwrap();
        assert!(!broker.extend(&claimed, Duration::from_secs(30)).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_extend_fails_after_claim_is_lost() {
        let broker = broker(30, 5);
        broker.publish("q", json!("slow")).await.unwrap();
        let first = broker.receive("q", Duration::ZERO).await.unwrap().unwrap();

        tokio::time::advance(Duration::from_secs(31)).await;
        let second = broker.receive("q", Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(second.delivery_count, 2);

        assert!(!broker.extend(&first, Duration::from_secs(30)).await.unwrap());
        assert!(broker.extend(&second, Duration::from_secs(30)).await.unwrap());
    }

    #[tokio::test]
    async fn test_dead_letter_after_max_deliveries() {
        let broker = broker(300, 2);
        broker.publish("q", json!({"poison": true})).await.unwrap();

        for _ in 0..2 {
            let d = broker.receive("q", Duration::ZERO).await.unwrap().unwrap();
            broker.nack(&d).await.unwrap();
        }

        assert!(broker.receive("q", Duration::ZERO).await.unwrap().is_none());
        assert_eq!(broker.dead_letters("q").await, vec![json!({"poison": true})]);
    }

    #[tokio::test]
    async fn test_receive_wakes_on_publish() {
        let broker = std::sync::Arc::new(broker(30, 5));
        let consumer = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.receive("q", Duration::from_secs(5)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        broker.publish("q", json!("late")).await.unwrap();

        let delivery = consumer.await.unwrap().unwrap().unwrap();
        assert_eq!(delivery.payload, json!("late"));
    }
}
