use crate::value::Value;
use xxhash_rust::xxh64::Xxh64;

/// Seed shared by every group-hash computation so fingerprints are stable
/// across processes.
const GROUP_HASH_SEED: u64 = 0x5ca1ab1e;

fn write_value(hasher: &mut Xxh64, value: &Value) {
    match value {
        Value::Null => hasher.update(&[0u8]),
        Value::Bool(b) => {
            hasher.update(&[1u8, u8::from(*b)]);
        }
        Value::Int(i) => {
            hasher.update(&[2u8]);
            hasher.update(&i.to_le_bytes());
        }
        Value::Float(f) => {
            // integral floats hash like their integer value so that numeric
            // group keys unify the way group_eq compares them
            if f.fract() == 0.0 && f.is_finite() && *f >= i64::MIN as f64 && *f <= i64::MAX as f64 {
                hasher.update(&[2u8]);
                hasher.update(&(*f as i64).to_le_bytes());
            } else {
                hasher.update(&[3u8]);
                hasher.update(&f.to_bits().to_le_bytes());
            }
        }
        Value::Text(s) => {
            hasher.update(&[4u8]);
            hasher.update(s.as_bytes());
        }
        Value::Timestamp(ts) => {
            hasher.update(&[5u8]);
            hasher.update(&ts.timestamp_micros().to_le_bytes());
        }
        Value::Interval(us) => {
            hasher.update(&[6u8]);
            hasher.update(&us.to_le_bytes());
        }
        Value::Bytes(b) => {
            hasher.update(&[7u8]);
            hasher.update(b);
        }
        Value::Array(items) => {
            hasher.update(&[8u8]);
            hasher.update(&(items.len() as u64).to_le_bytes());
            for item in items {
                write_value(hasher, item);
            }
        }
        Value::Json(j) => {
            hasher.update(&[9u8]);
            hasher.update(j.to_string().as_bytes());
        }
        Value::Record(fields) => {
            hasher.update(&[10u8]);
            hasher.update(&(fields.len() as u64).to_le_bytes());
            for (name, item) in fields {
                hasher.update(name.as_bytes());
                write_value(hasher, item);
            }
        }
    }
}

/// `hash_group(col, ...)`: the fingerprint combiners use to look up matrel
/// rows and workers use to shard partial results.
pub fn hash_group(values: &[Value]) -> u64 {
    let mut hasher = Xxh64::new(GROUP_HASH_SEED);
    for value in values {
        write_value(&mut hasher, value);
    }
    hasher.digest()
}

/// `ls_hash_group(col, ...)`: the large-state variant; each datum is reduced
/// to its own 64-bit digest before the digests are combined.
pub fn ls_hash_group(values: &[Value]) -> u64 {
    let mut outer = Xxh64::new(GROUP_HASH_SEED);
    for value in values {
        let mut inner = Xxh64::new(GROUP_HASH_SEED);
        write_value(&mut inner, value);
        outer.update(&inner.digest().to_le_bytes());
    }
    outer.digest()
}

/// Hashes an arbitrary byte key, used by the catalog cache.
pub fn hash_bytes(bytes: &[u8], seed: u64) -> u64 {
    let mut hasher = Xxh64::new(seed);
    hasher.update(bytes);
    hasher.digest()
}
