#[repr(transparent)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Bytes<T>(pub T);

#[repr(transparent)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Words32<T>(pub T);

impl<T> From<Words32<T>> for Bytes<T>
where
    T: std::ops::Mul<usize, Output = T>,
{
    fn from(value: Words32<T>) -> Self {
        Self(value.0 * 4)
    }
}

impl<T> Bytes<T>
where
    T: Copy,
    T: std::ops::Div<usize, Output = T>,
    T: std::ops::Rem<usize, Output = T>,
{
    /// Whole words, and the leftover bytes that do not fill one.
    pub fn as_words(self) -> (Words32<T>, Bytes<T>) {
        (Words32(self.0 / 4), Bytes(self.0 % 4))
    }
}
