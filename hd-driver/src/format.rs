//! Decoder for the module's tagged 32-bit data words.
//!
//! A word with bit 31 set defines a type, `[30:27]`. A word with bit 31 clear
//! continues the last type-defining word. A decoder header announces a run of
//! raw decoder words that are captured as-is, whatever their top bit.

use crate::error::DecodeError;

#[rustfmt::skip]
mod fields {
    use hd_io::Field;

    pub const TYPE_DEFINING  : Field = Field::bit(31);
    pub const TYPE           : Field = Field::new(30, 27);
    pub const SLOT           : Field = Field::new(26, 22);

    pub const MODULE_ID      : Field = Field::new(21, 18);
    pub const BLOCK_NUMBER   : Field = Field::new(17, 8);
    pub const EVENT_COUNT    : Field = Field::new(7, 0);

    pub const WORD_COUNT     : Field = Field::new(21, 0);

    pub const TRIGGER_TIME   : Field = Field::new(21, 12);
    pub const EVENT_NUMBER   : Field = Field::new(11, 0);

    pub const TIME_1         : Field = Field::new(26, 0);
    pub const TIME_2         : Field = Field::new(19, 0);

    pub const DECODER_COUNT  : Field = Field::new(5, 0);
}

/// Capacity of the decoder word capture buffer.
pub const DECODER_WORDS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Type {
    BlockHeader,
    BlockTrailer,
    EventHeader,
    TriggerTime,
    DecoderHeader,
    /// Raw word inside a decoder run. Has no type code of its own.
    DecoderData,
    EndOfEvent,
    DataNotValid,
    FillerWord,
    Undefined(u8),
}

impl Type {
    pub const fn from_code(code: u8) -> Self {
        match code & 0xf {
            0 => Self::BlockHeader,
            1 => Self::BlockTrailer,
            2 => Self::EventHeader,
            3 => Self::TriggerTime,
            8 => Self::DecoderHeader,
            13 => Self::EndOfEvent,
            14 => Self::DataNotValid,
            15 => Self::FillerWord,
            code => Self::Undefined(code),
        }
    }

    pub const fn code(self) -> Option<u8> {
        Some(match self {
            Self::BlockHeader => 0,
            Self::BlockTrailer => 1,
            Self::EventHeader => 2,
            Self::TriggerTime => 3,
            Self::DecoderHeader => 8,
            Self::DecoderData => return None,
            Self::EndOfEvent => 13,
            Self::DataNotValid => 14,
            Self::FillerWord => 15,
            Self::Undefined(code) => code,
        })
    }

    /// Type of a type-defining word, `None` for a continuation.
    pub const fn of(word: u32) -> Option<Self> {
        if fields::TYPE_DEFINING.is_set(word) {
            Some(Self::from_code(fields::TYPE.get(word) as u8))
        } else {
            None
        }
    }

    /// The header/type bits of a type-defining word.
    pub const fn header(self) -> u32 {
        match self.code() {
            Some(code) => fields::TYPE_DEFINING.mask() | fields::TYPE.with(code as u32),
            None => 0,
        }
    }
}

/// Fields carried by one word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Record {
    BlockHeader {
        slot: u8,
        module_id: u8,
        block_number: u16,
        event_count: u8,
    },
    BlockTrailer {
        slot: u8,
        word_count: u32,
    },
    EventHeader {
        slot: u8,
        trigger_time: u16,
        event_number: u16,
    },
    TriggerTime1 {
        time: u32,
    },
    TriggerTime2 {
        time: u32,
    },
    DecoderHeader {
        count: u8,
    },
    DecoderData {
        index: u8,
        word: u32,
    },
    EndOfEvent,
    DataNotValid {
        slot: u8,
    },
    FillerWord {
        slot: u8,
    },
    Undefined {
        code: u8,
    },
    /// Continuation of a type that carries nothing in its continuation words.
    Continuation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataWord {
    pub raw: u32,
    pub ty: Type,
    pub continuation: bool,
    pub record: Record,
}

/// Everything a decoder remembers between words, including the words
/// captured so far by a decoder run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecoderState {
    pub last_type: Type,
    pub is_continuation: bool,
    pub decoder_words_remaining: u8,
    pub decoder_index: u8,
    captured: [u32; DECODER_WORDS],
}

impl DecoderState {
    fn validate(&self) -> Result<(), DecodeError> {
        let end = self.decoder_index as usize + self.decoder_words_remaining as usize;
        if end > DECODER_WORDS {
            return Err(DecodeError::InvalidState {
                index: self.decoder_index,
                remaining: self.decoder_words_remaining,
            });
        }
        Ok(())
    }
}

impl Default for DecoderState {
    fn default() -> Self {
        Self {
            last_type: Type::FillerWord,
            is_continuation: false,
            decoder_words_remaining: 0,
            decoder_index: 0,
            captured: [0; DECODER_WORDS],
        }
    }
}

/// Stateful word classifier. Feed one block's words in order; call
/// [`Decoder::reset`] or [`Decoder::restore`] before switching streams.
#[derive(Debug, Clone)]
pub struct Decoder {
    state: DecoderState,
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            state: DecoderState::default(),
        }
    }

    pub fn state(&self) -> DecoderState {
        self.state
    }

    /// Continue from a saved state. A state whose decoder run would not fit
    /// the capture buffer is rejected and the current state kept.
    pub fn restore(&mut self, state: DecoderState) -> Result<(), DecodeError> {
        state.validate()?;
        self.state = state;
        Ok(())
    }

    pub fn reset(&mut self) {
        self.state = DecoderState::default();
    }

    pub fn in_decoder_run(&self) -> bool {
        self.state.decoder_words_remaining > 0
    }

    /// Words captured by the most recent decoder run.
    pub fn decoder_words(&self) -> &[u32] {
        &self.state.captured[..self.state.decoder_index as usize]
    }

    pub fn decode(&mut self, word: u32) -> Result<DataWord, DecodeError> {
        use fields::*;

        let state = &mut self.state;
        if state.decoder_words_remaining > 0 {
            let index = state.decoder_index;
            state.captured[index as usize] = word;
            state.decoder_index += 1;
            state.decoder_words_remaining -= 1;
            return Ok(DataWord {
                raw: word,
                ty: Type::DecoderData,
                continuation: false,
                record: Record::DecoderData { index, word },
            });
        }

        let slot = SLOT.get(word) as u8;
        let Some(ty) = Type::of(word) else {
            let after_fresh_trigger_time =
                state.last_type == Type::TriggerTime && !state.is_continuation;
            state.is_continuation = true;
            let record = match state.last_type {
                Type::TriggerTime if after_fresh_trigger_time => Record::TriggerTime2 {
                    time: TIME_2.get(word),
                },
                Type::TriggerTime => return Err(DecodeError::OrphanTriggerTime { word }),
                _ => Record::Continuation,
            };
            return Ok(DataWord {
                raw: word,
                ty: state.last_type,
                continuation: true,
                record,
            });
        };

        state.last_type = ty;
        state.is_continuation = false;
        let record = match ty {
            Type::BlockHeader => Record::BlockHeader {
                slot,
                module_id: MODULE_ID.get(word) as u8,
                block_number: BLOCK_NUMBER.get(word) as u16,
                event_count: EVENT_COUNT.get(word) as u8,
            },
            Type::BlockTrailer => Record::BlockTrailer {
                slot,
                word_count: WORD_COUNT.get(word),
            },
            Type::EventHeader => Record::EventHeader {
                slot,
                trigger_time: TRIGGER_TIME.get(word) as u16,
                event_number: EVENT_NUMBER.get(word) as u16,
            },
            Type::TriggerTime => Record::TriggerTime1 {
                time: TIME_1.get(word),
            },
            Type::DecoderHeader => {
                let count = DECODER_COUNT.get(word) as u8;
                state.decoder_words_remaining = count;
                state.decoder_index = 0;
                Record::DecoderHeader { count }
            }
            Type::EndOfEvent => Record::EndOfEvent,
            Type::DataNotValid => Record::DataNotValid { slot },
            Type::FillerWord => Record::FillerWord { slot },
            Type::Undefined(code) => Record::Undefined { code },
            Type::DecoderData => unreachable!("never produced by a type code"),
        };
        Ok(DataWord {
            raw: word,
            ty,
            continuation: false,
            record,
        })
    }

    pub fn decode_all(
        &mut self,
        words: impl IntoIterator<Item = u32>,
    ) -> impl Iterator<Item = Result<DataWord, DecodeError>> {
        words.into_iter().map(move |w| self.decode(w))
    }

    /// Decode a whole block, collecting protocol errors next to the words
    /// that raised them instead of stopping.
    pub fn decode_block(&mut self, words: &[u32]) -> BlockRecord {
        let mut block = BlockRecord::default();
        for (idx, &word) in words.iter().enumerate() {
            match self.decode(word) {
                Ok(word) => block.words.push(word),
                Err(e) => block.errors.push((idx, e)),
            }
        }
        block
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockRecord {
    pub words: Vec<DataWord>,
    /// Index into the input and the error it raised.
    pub errors: Vec<(usize, DecodeError)>,
}

impl BlockRecord {
    pub fn header(&self) -> Option<&DataWord> {
        self.words.iter().find(|w| w.ty == Type::BlockHeader && !w.continuation)
    }

    pub fn trailer(&self) -> Option<&DataWord> {
        self.words.iter().find(|w| w.ty == Type::BlockTrailer && !w.continuation)
    }

    pub fn decoder_words(&self) -> impl Iterator<Item = u32> + '_ {
        self.words.iter().filter_map(|w| match w.record {
            Record::DecoderData { word, .. } => Some(word),
            _ => None,
        })
    }
}

/// Filler word tagged with `slot`, used to pad transfers.
pub const fn filler_word(slot: u32) -> u32 {
    Type::FillerWord.header() | fields::SLOT.with(slot)
}

pub(crate) const fn is_block_header(word: u32) -> bool {
    matches!(Type::of(word), Some(Type::BlockHeader))
}

pub(crate) const fn is_block_trailer(word: u32) -> bool {
    matches!(Type::of(word), Some(Type::BlockTrailer))
}
