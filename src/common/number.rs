//! Operand encodings used inside bytecode streams.

/// Splits a number into 7-bit groups, most significant first.
/// Every group but the last has its high bit clear;
/// the last has it set, which ends the number:
/// ```plain
/// 0DDDDDDD 0DDDDDDD 1DDDDDDD
/// ```
/// So `300` becomes `[0b0000_0010, 0b1010_1100]`.
pub fn split_number(n: usize) -> Vec<u8> {
    let chunk = 0b1000_0000;
    let mut bytes = vec![(chunk | (n % chunk)) as u8];
    let mut rest = n / chunk;

    while rest != 0 {
        bytes.push((rest % chunk) as u8);
        rest /= chunk;
    }

    bytes.reverse();
    bytes
}

/// Reads the number starting at the front of `bytes`,
/// returning it with the count of bytes it took up.
/// Returns `None` if the stream ends before the closing group.
pub fn build_number(bytes: &[u8]) -> Option<(usize, usize)> {
    let chunk = 0b1000_0000;
    let mut n: usize = 0;

    for (eaten, byte) in bytes.iter().enumerate() {
        n = n.checked_mul(chunk as usize)?;
        if byte & chunk != 0 {
            return Some((n + (byte & !chunk) as usize, eaten + 1));
        }
        n += *byte as usize;
    }

    None
}

/// Branch targets are a fixed four bytes wide,
/// so they can be patched after the fact without moving code.
pub const ADDRESS_WIDTH: usize = 4;

pub fn split_address(address: u32) -> [u8; ADDRESS_WIDTH] {
    address.to_be_bytes()
}

pub fn build_address(bytes: &[u8]) -> Option<usize> {
    let raw: [u8; ADDRESS_WIDTH] = bytes.get(..ADDRESS_WIDTH)?.try_into().ok()?;
    Some(u32::from_be_bytes(raw) as usize)
}

#[cfg(test)]
mod test {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn rollover() {
        assert_eq!(split_number(128), vec![0b0000_0001, 0b1000_0000]);
        assert_eq!(split_number(300), vec![0b0000_0010, 0b1010_1100]);
    }

    #[test]
    fn zero() {
        let mut zero = split_number(0);
        zero.push(2);
        assert_eq!(build_number(&zero), Some((0, 1)));
    }

    #[test]
    fn truncated() {
        let mut bytes = split_number(42069);
        bytes.pop();
        assert_eq!(build_number(&bytes), None);
    }

    #[test]
    fn address() {
        let bytes = split_address(0x0102_0304);
        assert_eq!(bytes, [1, 2, 3, 4]);
        assert_eq!(build_address(&[1, 2, 3, 4, 0xFF]), Some(0x0102_0304));
        assert_eq!(build_address(&[1, 2]), None);
    }

    proptest! {
        #[test]
        fn trailing_junk_is_ignored(n in any::<usize>(), junk in proptest::collection::vec(any::<u8>(), 0..4)) {
            let mut bytes = split_number(n);
            let eaten = bytes.len();
            bytes.extend(junk);
            prop_assert_eq!(build_number(&bytes), Some((n, eaten)));
        }
    }
}
