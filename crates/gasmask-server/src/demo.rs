//! Demo mode: a scripted mask that streams synthetic frames.
//!
//! Lets the API and the companion app run without hardware. The script
//! cycles through clean air, a methane warning and a carbon monoxide spike so
//! every alert level shows up within a couple of minutes.

use std::time::Duration;

use gasmask_core::transport::MockTransport;
use gasmask_core::DeviceDescriptor;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Identifier of the simulated mask.
pub const DEMO_DEVICE_ID: &str = "D0:E0:00:00:00:01";

/// Time between frames.
const FRAME_INTERVAL: Duration = Duration::from_secs(2);

/// Channel values per step: `mq2`, `mq4`, `mq9`, `mq135`.
const SCRIPT: &[[f64; 4]] = &[
    [120.0, 80.0, 35.0, 12.0],
    [140.0, 95.0, 40.0, 14.0],
    [160.0, 1200.0, 42.0, 15.0],
    [180.0, 1900.0, 48.0, 18.0],
    [150.0, 1750.0, 60.0, 16.0],
    [130.0, 200.0, 900.0, 15.0],
    [135.0, 120.0, 4200.0, 20.0],
    [140.0, 110.0, 4600.0, 22.0],
    [125.0, 90.0, 1200.0, 14.0],
    [118.0, 82.0, 38.0, 12.0],
];

/// A transport that discovers the simulated mask.
#[must_use]
pub fn transport() -> MockTransport {
    MockTransport::new(vec![DeviceDescriptor::bluetooth(
        DEMO_DEVICE_ID,
        Some("GasMask Demo".to_string()),
    )])
}

/// Renders step `index` of the script as a text frame.
#[must_use]
pub fn frame(index: usize) -> String {
    let [mq2, mq4, mq9, mq135] = SCRIPT[index % SCRIPT.len()];
    format!("mq2:{mq2},mq4:{mq4},mq9:{mq9},mq135:{mq135}")
}

/// Pushes the next script step every couple of seconds while a session is
/// open. Steps are not consumed while disconnected.
pub fn spawn_feeder(transport: MockTransport) -> JoinHandle<()> {
    info!(device_id = DEMO_DEVICE_ID, "Demo feeder started");
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(FRAME_INTERVAL);
        let mut step = 0;
        loop {
            ticker.tick().await;
            if transport.push_frame(&frame(step)) {
                debug!(step, "Demo frame sent");
                step += 1;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use gasmask_core::decoder::decode_frame;
    use gasmask_core::{AlertLevel, ThresholdConfig};

    #[test]
    fn test_every_frame_decodes() {
        for step in 0..SCRIPT.len() {
            assert!(decode_frame(&frame(step)).is_ok(), "step {step}");
        }
    }

    #[test]
    fn test_script_reaches_every_level() {
        let thresholds = ThresholdConfig::default();
        let levels: Vec<AlertLevel> = (0..SCRIPT.len())
            .map(|step| thresholds.overall_level(&decode_frame(&frame(step)).unwrap()))
            .collect();
        assert!(levels.contains(&AlertLevel::Normal));
        assert!(levels.contains(&AlertLevel::Warning));
        assert!(levels.contains(&AlertLevel::Danger));
    }

    #[tokio::test(start_paused = true)]
    async fn test_feeder_waits_for_a_session() {
        let transport = transport();
        let feeder = spawn_feeder(transport.clone());
        tokio::time::sleep(FRAME_INTERVAL * 3).await;
        assert!(!transport.is_linked());
        feeder.abort();
    }
}
