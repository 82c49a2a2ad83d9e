//! CRC-64/ECMA-182 (reflected, all-ones init and xor-out), the checksum the
//! service publishes for stored objects.
//!
//! [`Crc64::combine`] folds the CRC of two adjacent byte runs using the
//! GF(2) matrix-squaring technique, so a whole-object CRC can be built from
//! per-part CRCs without re-reading data.

/// Reflected ECMA-182 polynomial.
const POLY: u64 = 0xC96C_5795_D787_0F42;

const TABLE: [u64; 256] = make_table();

const fn make_table() -> [u64; 256] {
    let mut table = [0u64; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u64;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 == 1 { (crc >> 1) ^ POLY } else { crc >> 1 };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// Streaming CRC64 state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Crc64 {
    value: u64,
}

impl Crc64 {
    pub fn new() -> Self {
        Self::default()
    }

    /// Continues the checksum from a previously computed value.
    pub fn with_initial(value: u64) -> Self {
        Self { value }
    }

    pub fn update(&mut self, data: &[u8]) {
        let mut crc = !self.value;
        for &b in data {
            crc = TABLE[((crc ^ u64::from(b)) & 0xff) as usize] ^ (crc >> 8);
        }
        self.value = !crc;
    }

    pub fn value(&self) -> u64 {
        self.value
    }

    /// Returns the CRC of `A || B` given `crc(A)`, `crc(B)` and `len(B)`.
    pub fn combine(crc_a: u64, crc_b: u64, len_b: u64) -> u64 {
        if len_b == 0 {
            return crc_a;
        }

        let mut even = [0u64; 64];
        let mut odd = [0u64; 64];

        // Operator for one zero bit.
        odd[0] = POLY;
        let mut row = 1u64;
        for slot in odd.iter_mut().skip(1) {
            *slot = row;
            row <<= 1;
        }

        // Two zero bits, then four.
        gf2_matrix_square(&mut even, &odd);
        gf2_matrix_square(&mut odd, &even);

        let mut crc = crc_a;
        let mut len = len_b;
        loop {
            gf2_matrix_square(&mut even, &odd);
            if len & 1 != 0 {
                crc = gf2_matrix_times(&even, crc);
            }
            len >>= 1;
            if len == 0 {
                break;
            }

            gf2_matrix_square(&mut odd, &even);
            if len & 1 != 0 {
                crc = gf2_matrix_times(&odd, crc);
            }
            len >>= 1;
            if len == 0 {
                break;
            }
        }

        crc ^ crc_b
    }
}

/// Computes the CRC64 of `data` in one call.
pub fn checksum(data: &[u8]) -> u64 {
    let mut crc = Crc64::new();
    crc.update(data);
    crc.value()
}

/// Folds `(crc, len)` pairs of adjacent runs, in order, into one CRC.
pub fn fold<I>(runs: I) -> u64
where
    I: IntoIterator<Item = (u64, u64)>,
{
    runs.into_iter()
        .fold(0, |acc, (crc, len)| Crc64::combine(acc, crc, len))
}

fn gf2_matrix_times(mat: &[u64; 64], mut vec: u64) -> u64 {
    let mut sum = 0;
    let mut i = 0;
    while vec != 0 {
        if vec & 1 != 0 {
            sum ^= mat[i];
        }
        vec >>= 1;
        i += 1;
    }
    sum
}

fn gf2_matrix_square(square: &mut [u64; 64], mat: &[u64; 64]) {
    for (n, slot) in square.iter_mut().enumerate() {
        *slot = gf2_matrix_times(mat, mat[n]);
    }
}
