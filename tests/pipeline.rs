use std::sync::Arc;
use std::time::Duration;

use counter_ingest::config::{ChannelConfig, Config, DeviceConfig, WriterConfig};
use counter_ingest::devices::{CounterEvent, DataQuality, DeviceReading, HealthState};
use counter_ingest::modbus::{MockBehavior, MockModbusServer};
use counter_ingest::{DevicePool, MemorySink};
use tokio::sync::broadcast;
use tokio::time::{sleep, timeout};

fn device_for(server: &MockModbusServer) -> DeviceConfig {
    let (host, port) = server.address().rsplit_once(':').unwrap();
    DeviceConfig {
        device_id: "adam-01".to_string(),
        host: host.to_string(),
        port: port.parse().unwrap(),
        poll_interval_ms: 25,
        timeout_ms: 100,
        max_retries: 0,
        channels: vec![
            ChannelConfig {
                channel_number: 0,
                start_register: 0,
                register_count: 2,
                ..ChannelConfig::default()
            },
            ChannelConfig {
                channel_number: 1,
                start_register: 10,
                register_count: 1,
                scale_factor: 0.5,
                ..ChannelConfig::default()
            },
        ],
        ..DeviceConfig::default()
    }
}

fn config_for(device: DeviceConfig) -> Config {
    let mut config = Config {
        devices: vec![device],
        writer: WriterConfig {
            batch_size: 4,
            flush_interval_ms: 20,
            ..WriterConfig::default()
        },
        ..Config::default()
    };
    config.backoff.enabled = false;
    config.health.failure_threshold = 2;
    config.health.recovery_threshold = 2;
    config.validate().unwrap();
    config
}

async fn next_matching<F>(readings: &mut broadcast::Receiver<DeviceReading>, predicate: F) -> DeviceReading
where
    F: Fn(&DeviceReading) -> bool,
{
    timeout(Duration::from_secs(5), async {
        loop {
            match readings.recv().await {
                Ok(reading) if predicate(&reading) => return reading,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("reading tap closed"),
            }
        }
    })
    .await
    .expect("no matching reading within 5s")
}

#[tokio::test]
async fn test_counts_flow_from_device_to_sink() {
    let server = MockModbusServer::start().await.unwrap();
    server.set_counter(0, 1000).await;
    server.set_register(10, 65530).await;

    let sink = MemorySink::new();
    let config = config_for(device_for(&server));
    let pool = DevicePool::start(&config, Arc::new(sink.clone()));
    let mut readings = pool.subscribe();

    let first = next_matching(&mut readings, |r| r.channel == 0).await;
    assert_eq!(first.event, CounterEvent::Baseline);
    assert_eq!(first.raw_value, Some(1000));
    assert_eq!(first.rate, None);
    next_matching(&mut readings, |r| r.channel == 1 && r.raw_value == Some(65530)).await;

    server.set_counter(0, 1500).await;
    // 16-bit channel wraps: 65530 -> 4 is 10 counts
    server.set_register(10, 4).await;

    let counted = next_matching(&mut readings, |r| r.channel == 0 && r.raw_value == Some(1500)).await;
    assert_eq!(counted.event, CounterEvent::Increment);
    assert_eq!(counted.quality, DataQuality::Good);
    assert_eq!(counted.processed_value, Some(1500.0));
    assert!(counted.rate.unwrap() > 0.0);

    let wrapped = next_matching(&mut readings, |r| r.channel == 1 && r.raw_value == Some(4)).await;
    assert_eq!(wrapped.event, CounterEvent::Overflow);
    assert_eq!(wrapped.processed_value, Some((65530.0 + 10.0) * 0.5));
    assert!(wrapped.rate.unwrap() > 0.0);

    let report = pool.stop(Duration::from_secs(2)).await;
    assert!(report.is_clean());
    assert_eq!(report.stopped.len(), 1);
    assert_eq!(report.stopped[0].total_failures, 0);
    assert_eq!(report.stopped[0].state, HealthState::Healthy);

    // Everything produced before stop was drained to the sink
    let stored = sink.readings();
    let stats = report.writer.unwrap();
    assert_eq!(stats.written as usize, stored.len());
    assert_eq!(stats.buffered, 0);
    assert_eq!(stats.dropped, 0);
    assert!(stored.iter().any(|r| r.channel == 1 && r.event == CounterEvent::Overflow));

    // Totals never go backwards per channel
    for channel in [0u16, 1] {
        let totals: Vec<f64> = stored
            .iter()
            .filter(|r| r.channel == channel)
            .filter_map(|r| r.processed_value)
            .collect();
        assert!(totals.windows(2).all(|w| w[1] >= w[0]), "channel {} totals {:?}", channel, totals);
    }

    server.shutdown().await;
}

#[tokio::test]
async fn test_silent_device_goes_unhealthy_and_recovers() {
    let server = MockModbusServer::start().await.unwrap();
    server.set_counter(0, 10).await;
    server.set_register(10, 10).await;

    let sink = MemorySink::new();
    let config = config_for(device_for(&server));
    let pool = DevicePool::start(&config, Arc::new(sink.clone()));
    let mut readings = pool.subscribe();
    next_matching(&mut readings, |r| r.quality == DataQuality::Good || r.event == CounterEvent::Baseline).await;

    server.set_behavior(MockBehavior::Silent).await;
    let failed = next_matching(&mut readings, |r| r.event == CounterEvent::ReadFailure).await;
    assert_eq!(failed.quality, DataQuality::Bad);
    assert_eq!(failed.raw_value, None);

    let health = pool.health_handles().remove(0);
    timeout(Duration::from_secs(5), async {
        while health.current().state != HealthState::Unhealthy {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("device never became unhealthy");
    assert!(health.current().last_error.is_some());

    server.set_counter(0, 20).await;
    server.set_behavior(MockBehavior::Normal).await;
    let recovered = next_matching(&mut readings, |r| r.channel == 0 && r.raw_value == Some(20)).await;
    // Baseline survived the outage, so the first good read yields a rate
    assert_eq!(recovered.processed_value, Some(20.0));
    assert!(recovered.rate.is_some());

    timeout(Duration::from_secs(5), async {
        while health.current().state != HealthState::Healthy {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("device never recovered");

    let report = pool.stop(Duration::from_secs(2)).await;
    assert!(report.is_clean());
    assert!(report.stopped[0].total_failures >= 2);
    assert!(sink.readings().iter().any(|r| r.event == CounterEvent::ReadFailure));
    assert!(server.connection_count() >= 2);
    server.shutdown().await;
}

#[tokio::test]
async fn test_sink_outage_does_not_stall_polling() {
    let server = MockModbusServer::start().await.unwrap();
    server.set_counter(0, 100).await;
    server.set_register(10, 100).await;

    let sink = MemorySink::new();
    sink.set_unavailable(true);
    let mut config = config_for(device_for(&server));
    config.writer = WriterConfig {
        batch_size: 4,
        flush_interval_ms: 20,
        max_buffer_size: 8,
        max_flush_attempts: 2,
        retry_base_delay_ms: 5,
        retry_max_delay_ms: 10,
    };
    config.validate().unwrap();

    let pool = DevicePool::start(&config, Arc::new(sink.clone()));
    let health = pool.health_handles().remove(0);

    timeout(Duration::from_secs(5), async {
        while pool.writer_stats().dropped == 0 {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("buffer cap never reached");

    let polls_at_cap = health.current().total_polls;
    let stats = pool.writer_stats();
    assert!(stats.buffered <= 8);
    assert!(stats.failed_flushes >= 1);
    assert!(sink.readings().is_empty());

    // Polling carries on while the sink is down
    timeout(Duration::from_secs(5), async {
        while health.current().total_polls < polls_at_cap + 3 {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("polling stalled");
    let current = health.current();
    assert_eq!(current.state, HealthState::Healthy);
    assert_eq!(current.total_failures, 0);
    assert!(pool.writer_stats().dropped > stats.dropped);

    sink.set_unavailable(false);
    timeout(Duration::from_secs(5), async {
        while sink.readings().is_empty() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("nothing written after the sink came back");

    let report = pool.stop(Duration::from_secs(2)).await;
    assert!(report.is_clean());
    let stats = report.writer.unwrap();
    assert_eq!(stats.written as usize, sink.readings().len());
    assert_eq!(stats.enqueued, stats.written + stats.dropped);
    server.shutdown().await;
}
