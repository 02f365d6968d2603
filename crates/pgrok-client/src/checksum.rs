//! POSIX `cksum` compatible CRC-32 and relay port derivation
//!
//! The relay host derives the reverse-forward port for a subdomain with
//! `cksum`, so this must match it bit for bit: MSB-first CRC-32 with
//! polynomial `0x04C11DB7`, the input length appended little-end first,
//! and the final value inverted.

/// CRC-32 generator polynomial (big-endian form)
const POLYNOMIAL: u32 = 0x04C1_1DB7;

/// First port of the relay-side range
pub const REMOTE_PORT_BASE: u16 = 10_000;

/// Number of ports in the relay-side range
pub const REMOTE_PORT_SPAN: u32 = 50_000;

const TABLE: [u32; 256] = build_table();

const fn build_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = (i as u32) << 24;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x8000_0000 != 0 {
                (crc << 1) ^ POLYNOMIAL
            } else {
                crc << 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

#[inline]
fn step(crc: u32, byte: u8) -> u32 {
    (crc << 8) ^ TABLE[(((crc >> 24) ^ byte as u32) & 0xFF) as usize]
}

/// Compute the `cksum` value of a byte sequence
pub fn cksum(data: &[u8]) -> u32 {
    let mut crc = data.iter().fold(0u32, |crc, &byte| step(crc, byte));

    let mut length = data.len() as u64;
    while length != 0 {
        crc = step(crc, (length & 0xFF) as u8);
        length >>= 8;
    }

    !crc
}

/// Derive the relay-side port for a subdomain
///
/// Distinct subdomains can map to the same port. Nothing detects that; the
/// newest session simply claims the port.
pub fn derive_remote_port(subdomain: &str) -> u16 {
    let offset = cksum(subdomain.as_bytes()) % REMOTE_PORT_SPAN;
    REMOTE_PORT_BASE + offset as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_matches_reference_entries() {
        assert_eq!(TABLE[0], 0);
        assert_eq!(TABLE[1], 0x04C1_1DB7);
        assert_eq!(TABLE[255], 0xB1F7_40B4);
    }

    #[test]
    fn test_cksum_empty_input() {
        assert_eq!(cksum(b""), 4_294_967_295);
    }

    #[test]
    fn test_cksum_reference_vectors() {
        // Values produced by `printf '%s' <input> | cksum`
        assert_eq!(cksum(b"a"), 1_220_704_766);
        assert_eq!(cksum(b"abc"), 1_219_131_554);
        assert_eq!(cksum(b"demo"), 3_420_562_566);
        assert_eq!(cksum(b"myapp"), 3_057_370_603);
        assert_eq!(cksum(b"hello-world"), 1_178_800_036);
        assert_eq!(cksum(b"123456789"), 930_766_865);
    }

    #[test]
    fn test_cksum_long_input_encodes_multibyte_length() {
        // 300 bytes needs two length bytes; must differ from the same bytes
        // hashed without the length suffix
        let data = vec![b'x'; 300];
        let without_length = !data.iter().fold(0u32, |crc, &b| step(crc, b));
        assert_ne!(cksum(&data), without_length);
    }

    #[test]
    fn test_derive_remote_port_known_values() {
        assert_eq!(derive_remote_port("myapp"), 30_603);
        assert_eq!(derive_remote_port("demo"), 22_566);
        assert_eq!(derive_remote_port("hello-world"), 10_036);
    }

    #[test]
    fn test_derive_remote_port_range() {
        let longest = "a".repeat(63);
        for name in ["a", "z", "api", "my-app-01", "x0", longest.as_str()] {
            let port = derive_remote_port(name);
            assert!((10_000..=59_999).contains(&port), "{} -> {}", name, port);
        }
    }

    #[test]
    fn test_derive_remote_port_is_deterministic() {
        assert_eq!(derive_remote_port("staging"), derive_remote_port("staging"));
    }
}
