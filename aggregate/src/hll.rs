use freshet_common::hash::hash_group;
use freshet_common::value::Value;
use serde::{Deserialize, Serialize};

/// Register-index bits; 2^14 registers keeps the relative error near 0.81%.
const P: u32 = 14;
const M: usize = 1 << P;

/// Dense HyperLogLog sketch. Union is the elementwise register max, which
/// makes it a valid combine function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hll {
    registers: Vec<u8>,
}

impl Default for Hll {
    fn default() -> Self {
        Self::new()
    }
}

impl Hll {
    pub fn new() -> Self {
        Self {
            registers: vec![0u8; M],
        }
    }

    pub fn add(&mut self, values: &[Value]) {
        let hash = hash_group(values);
        let idx = (hash >> (64 - P)) as usize;
        let rest = hash << P;
        // rank of the first set bit in the remaining 64 - P bits
        let rho = (rest.leading_zeros().min(64 - P) + 1) as u8;
        if self.registers[idx] < rho {
            self.registers[idx] = rho;
        }
    }

    pub fn merge(&mut self, other: &Hll) {
        for (mine, theirs) in self.registers.iter_mut().zip(other.registers.iter()) {
            if *mine < *theirs {
                *mine = *theirs;
            }
        }
    }

    pub fn cardinality(&self) -> i64 {
        let m = M as f64;
        let alpha = 0.7213 / (1.0 + 1.079 / m);
        let mut sum = 0.0;
        let mut zeros = 0usize;
        for &reg in &self.registers {
            sum += 1.0 / f64::from(1u32 << u32::from(reg.min(31)));
            if reg == 0 {
                zeros += 1;
            }
        }
        let raw = alpha * m * m / sum;
        let estimate = if raw <= 2.5 * m && zeros > 0 {
            // linear counting for the small range
            m * (m / zeros as f64).ln()
        } else {
            raw
        };
        estimate.round() as i64
    }
}
