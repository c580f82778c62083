use std::{
    fmt::Debug,
    sync::{Arc, Mutex},
};

use hd_io::FakeBackend;
use tracing::{
    Event, Subscriber,
    field::{Field, Visit},
};
use tracing_subscriber::layer::{Context, Layer};

use crate::{HelicityDecoder, InitOptions, registers::Reg};

/// Slot 5.
pub const A24: u32 = 5 << 19;
/// Board type 0x4844, revision 1, supported firmware.
pub const VERSION: u32 = 0x4844_0103;

pub fn fake() -> FakeBackend {
    let fake = FakeBackend::new(A24).with_eeprom(
        Reg::EepromCsr.offset(),
        Reg::EepromData.offset(),
        0x400,
        2,
    );
    fake.set(Reg::Version.offset(), VERSION);
    fake
}

/// Layer keeping the message of every event it sees.
#[derive(Debug, Clone, Default)]
pub struct Messages(Arc<Mutex<Vec<String>>>);

impl Messages {
    pub fn count(&self, message: &str) -> usize {
        self.0.lock().unwrap().iter().filter(|m| *m == message).count()
    }
}

struct MessageVisitor(Option<String>);

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn Debug) {
        if field.name() == "message" {
            self.0 = Some(format!("{value:?}"));
        }
    }
}

impl<S: Subscriber> Layer<S> for Messages {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor(None);
        event.record(&mut visitor);
        if let Some(message) = visitor.0 {
            self.0.lock().unwrap().push(message);
        }
    }
}

/// A fully initialized board in slot 5, with its initialization still in
/// the operation log.
pub fn initialized() -> (HelicityDecoder<FakeBackend>, FakeBackend) {
    let fake = fake();
    let hd = HelicityDecoder::new(fake.clone());
    hd.initialize(InitOptions {
        address: 5,
        ..Default::default()
    })
    .unwrap();
    (hd, fake)
}
