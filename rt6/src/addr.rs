// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bit operations over 128-bit IPv6 keys.
//!
//! Bits are numbered from the most significant bit of the first octet, so
//! bit 0 of `8000::` is set and bit 127 of `::1` is set.

use std::net::Ipv6Addr;

/// Number of bits in an IPv6 address.
pub const ADDR_BITS: u8 = 128;

fn words(a: &Ipv6Addr) -> [u32; 4] {
    let o = a.octets();
    [
        u32::from_be_bytes([o[0], o[1], o[2], o[3]]),
        u32::from_be_bytes([o[4], o[5], o[6], o[7]]),
        u32::from_be_bytes([o[8], o[9], o[10], o[11]]),
        u32::from_be_bytes([o[12], o[13], o[14], o[15]]),
    ]
}

/// Returns true if the first `prefixlen` bits of `a` and `b` are identical.
pub fn addr_match(a: &Ipv6Addr, b: &Ipv6Addr, prefixlen: u8) -> bool {
    let prefixlen = prefixlen.min(ADDR_BITS) as usize;
    let (wa, wb) = (words(a), words(b));

    let full = prefixlen / 32;
    if wa[..full] != wb[..full] {
        return false;
    }

    let rest = prefixlen % 32;
    if rest != 0 {
        let mask = !0u32 << (32 - rest);
        if (wa[full] ^ wb[full]) & mask != 0 {
            return false;
        }
    }
    true
}

/// Returns whether bit number `bit` of `addr` is set. Bits past the end of
/// the address read as unset.
pub fn addr_bit_set(addr: &Ipv6Addr, bit: u8) -> bool {
    if bit >= ADDR_BITS {
        return false;
    }
    let octet = addr.octets()[(bit >> 3) as usize];
    octet & (0x80 >> (bit & 0x7)) != 0
}

pub fn addr_bit_equal(a: &Ipv6Addr, b: &Ipv6Addr, bit: u8) -> bool {
    addr_bit_set(a, bit) == addr_bit_set(b, bit)
}

/// Index of the most significant bit at which `a` and `b` differ.
///
/// Only meaningful for distinct addresses; equal addresses yield
/// [`ADDR_BITS`].
pub fn addr_diff(a: &Ipv6Addr, b: &Ipv6Addr) -> u8 {
    debug_assert_ne!(a, b, "addr_diff on identical addresses");
    let (wa, wb) = (words(a), words(b));
    for (i, (x, y)) in wa.iter().zip(wb.iter()).enumerate() {
        let xb = x ^ y;
        if xb != 0 {
            return (i as u8) * 32 + xb.leading_zeros() as u8;
        }
    }
    ADDR_BITS
}

/// Zero every bit of `addr` past `prefixlen`.
pub fn prefix_mask(addr: &Ipv6Addr, prefixlen: u8) -> Ipv6Addr {
    let bits = u128::from(*addr);
    let mask = match prefixlen.min(ADDR_BITS) {
        0 => 0,
        n => !0u128 << (128 - n as u32),
    };
    Ipv6Addr::from(bits & mask)
}
