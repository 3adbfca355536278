use crate::stack::CallStack;

const SEED: u32 = 0xD202_EF8D;
const POLY: u32 = 0xEDB8_8320;

/// Grouping key of a call stack: leaks with equal fingerprints are the same leak.
///
/// A CRC-32 over the native-endian bytes of every return address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct LeakFingerprint(pub u32);

impl LeakFingerprint {
    pub fn of(stack: &CallStack) -> Self {
        let crc = stack
            .frames()
            .iter()
            .flat_map(|address| address.to_ne_bytes())
            .fold(!SEED, |crc, byte| {
                (0..8).fold(crc ^ u32::from(byte), |crc, _| {
                    if crc & 1 == 1 {
                        (crc >> 1) ^ POLY
                    } else {
                        crc >> 1
                    }
                })
            });
        Self(!crc)
    }
}

impl std::fmt::Display for LeakFingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:08X}", self.0)
    }
}

#[cfg(test)]
mod test {

    use super::*;

    #[test]
    fn test_should_be_deterministic() {
        let stack = CallStack::new(vec![0x1000, 0x2000, 0x3000]);
        assert_eq!(LeakFingerprint::of(&stack), LeakFingerprint::of(&stack.clone()));
    }

    #[test]
    fn test_should_depend_on_order() {
        let a = CallStack::new(vec![0x1000, 0x2000]);
        let b = CallStack::new(vec![0x2000, 0x1000]);
        assert_ne!(LeakFingerprint::of(&a), LeakFingerprint::of(&b));
    }

    #[test]
    fn test_should_distinguish_truncated_stack() {
        let full = CallStack::new(vec![0x1000, 0x2000]);
        let truncated = CallStack::new(vec![0x1000]);
        assert_ne!(LeakFingerprint::of(&full), LeakFingerprint::of(&truncated));
    }

    #[test]
    fn test_should_fingerprint_empty_stack_as_seed() {
        assert_eq!(LeakFingerprint::of(&CallStack::default()).0, SEED);
    }

    #[test]
    fn test_should_format_as_hex() {
        assert_eq!(LeakFingerprint(0xAB).to_string(), "000000AB");
    }
}
