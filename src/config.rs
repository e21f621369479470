use std::time::Duration;

/// Tunables for both controllers, the durable queue interaction and the sharding
///  wrappers. Shared as `Arc<DeliveryConfig>` between all parties of one logical
///  producer/consumer pair.
#[derive(Debug)]
pub struct DeliveryConfig {
    /// number of sequence numbers the consumer keeps requested ahead of the last
    ///  confirmed one. The consumer tops the window up when half of it is consumed.
    pub request_window: u64,

    /// interval in which the producer retransmits an epoch's first message until
    ///  the consumer's first Request confirms it
    pub resend_first_interval: Duration,

    /// interval in which the consumer re-sends Request / Resend / RegisterConsumer
    ///  as a safety net against lost control messages
    pub retry_interval: Duration,

    pub durable_load_timeout: Duration,
    pub durable_store_timeout: Duration,
    /// number of attempts for LoadState / StoreMessageSent before the producer
    ///  controller gives up and fails
    pub durable_retry_attempts: u32,

    /// upper bound for messages buffered across all entities in a
    ///  ShardingProducerController, and for the ShardingConsumerController's
    ///  pre-start stash
    pub sharding_buffer_size: usize,
}

impl DeliveryConfig {
    pub fn new() -> DeliveryConfig {
        DeliveryConfig {
            request_window: 20,
            resend_first_interval: Duration::from_secs(1),
            retry_interval: Duration::from_secs(1),
            durable_load_timeout: Duration::from_secs(3),
            durable_store_timeout: Duration::from_secs(3),
            durable_retry_attempts: 10,
            sharding_buffer_size: 1000,
        }
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self::new()
    }
}
