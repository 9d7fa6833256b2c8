/// Widening casts that cannot lose information on supported targets
pub trait SafeCast<T> {
    fn safe_cast(self) -> T;
}

impl SafeCast<usize> for u16 {
    fn safe_cast(self) -> usize {
        self as usize
    }
}

#[cfg(not(target_pointer_width = "16"))]
impl SafeCast<usize> for u32 {
    fn safe_cast(self) -> usize {
        self as usize
    }
}


/// For narrowing casts where business logic ensures that the value is in the narrower type's range.
/// NB: The implementations will panic otherwise
pub trait PrecheckedCast<T> {
    fn prechecked_cast(self) -> T;
}
impl PrecheckedCast<u16> for usize {
    fn prechecked_cast(self) -> u16 {
        self.try_into().expect("this is a bug: application logic should have ensured the value range")
    }
}


/// Narrowing casts for counters that are reported to the peer: values beyond the target range are
///  reported as the range's maximum
pub trait SaturatingCast<T> {
    fn saturating_cast(self) -> T;
}
impl SaturatingCast<i32> for usize {
    fn saturating_cast(self) -> i32 {
        self.try_into().unwrap_or(i32::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::zero(0, 0)]
    #[case::small(1420, 1420)]
    #[case::max(i32::MAX as usize, i32::MAX)]
    #[case::beyond(i32::MAX as usize + 1, i32::MAX)]
    #[case::huge(usize::MAX, i32::MAX)]
    fn test_saturating_cast(#[case] value: usize, #[case] expected: i32) {
        assert_eq!(SaturatingCast::<i32>::saturating_cast(value), expected);
    }

    #[test]
    #[should_panic]
    fn test_prechecked_cast_out_of_range() {
        let _: u16 = PrecheckedCast::<u16>::prechecked_cast(70_000usize);
    }
}
