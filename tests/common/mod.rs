#![allow(dead_code)]

use std::sync::Arc;

use btleplug::api::CharPropFlags;
use mockall::mock;
use parking_lot::Mutex;
use uuid::Uuid;

use simple_bluetooth_printer::platform::fake::{FakePeripheral, FakePlatform};
use simple_bluetooth_printer::{AddressableDevice, ConnectionState, Event, EventSink};

pub const PRINTER: &str = "66:22:B3:10:4C:01";
pub const OTHER_PRINTER: &str = "66:22:B3:10:4C:02";
pub const CLASSIC_PRINTER: &str = "00:15:83:3D:0A:57";

pub const WRITE_CHAR: Uuid = Uuid::from_u128(0x49535343_8841_43f4_a8d4_ecbe34729bb3);

mock! {
    pub Sink {}
    impl EventSink for Sink {
        fn send(&self, event: Event);
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Events pushed to the host, in order.
#[derive(Clone, Default)]
pub struct Recorder {
    events: Arc<Mutex<Vec<Event>>>,
}

impl Recorder {
    pub fn sink(&self) -> Arc<dyn EventSink> {
        let events = self.events.clone();
        Arc::new(move |event: Event| events.lock().push(event))
    }

    pub fn states(&self) -> Vec<ConnectionState> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                Event::ConnectionStateChanged(state) => Some(*state),
                _ => None,
            })
            .collect()
    }

    pub fn scan_results(&self) -> Vec<AddressableDevice> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                Event::ScanResult(device) => Some(device.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, state: ConnectionState) -> usize {
        self.states().into_iter().filter(|s| *s == state).count()
    }
}

pub fn printer(address: &str) -> Arc<FakePeripheral> {
    Arc::new(FakePeripheral::new(address).with_characteristic(
        WRITE_CHAR,
        CharPropFlags::WRITE | CharPropFlags::WRITE_WITHOUT_RESPONSE,
    ))
}

pub fn platform_with(peripherals: &[Arc<FakePeripheral>]) -> Arc<FakePlatform> {
    let platform = Arc::new(FakePlatform::new());
    for peripheral in peripherals {
        platform.add_ble_peripheral(peripheral.clone());
    }
    platform
}

/// Let spawned tasks run.
pub async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}
