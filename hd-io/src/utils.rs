use std::fmt::Display;

pub struct Hex<T>(pub T);
impl Display for Hex<u8> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:02X}", self.0)
    }
}
impl Display for Hex<u16> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:04X}", self.0)
    }
}
impl Display for Hex<u32> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:08X}", self.0)
    }
}

const MAX_DISPLAY: usize = 16;

pub struct ShortHex<'a>(pub &'a [u32]);
impl Display for ShortHex<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        for (idx, e) in self.0.iter().take(MAX_DISPLAY).enumerate() {
            if idx != 0 {
                write!(f, " ")?;
            }
            write!(f, "{:08X}", e)?;
        }
        if self.0.len() > MAX_DISPLAY {
            write!(f, " ...")?;
        }
        Ok(())
    }
}

/// Full dump, four words per line, each line prefixed by its word index.
pub struct WordDump<'a>(pub &'a [u32]);
impl Display for WordDump<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        for (line, chunk) in self.0.chunks(4).enumerate() {
            write!(f, "{:4}:", line * 4)?;
            for w in chunk {
                write!(f, " {:08X}", w)?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dump() {
        let words = [0x8000_0105, 1, 2, 3, 0x8800_0002];
        assert_eq!(
            WordDump(&words).to_string(),
            "   0: 80000105 00000001 00000002 00000003\n   4: 88000002\n"
        );
        assert_eq!(ShortHex(&words[..2]).to_string(), "80000105 00000001");
        assert_eq!(Hex(0xABu8).to_string(), "AB");
    }
}
