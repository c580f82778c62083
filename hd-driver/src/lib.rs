mod config;
mod device;
mod error;
pub mod firmware;
pub mod format;
mod readout;
pub mod registers;
#[cfg(test)]
mod testing;

pub use crate::{
    config::{
        GeneratorConfig, HelicityInversion, HelicitySource, InitFlags, InitOptions, Poll,
        ProcDelay, ResetKind, ResetPolicy, Settings, SignalSource, SignalSources,
    },
    device::{Board, BusyStatus, DelayConfirmation, HelicityDecoder, PllStatus, Scalers, Status},
    error::{DecodeError, Diagnostic, Error, Result},
    firmware::{FirmwareImage, FirmwareSession, MAX_IMAGE_SIZE, reverse_bits},
    format::{BlockRecord, DataWord, Decoder, DecoderState, Record, Type},
    readout::ReadMode,
};
