use std::fmt;

use serde::{Deserialize, Serialize};

/// Globally unique distributed transaction identifier (XA triple).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Xid {
    /// Implementation specific format code
    pub format: i32,
    pub global_id: Vec<u8>,
    /// Branch qualifier
    pub branch_id: Vec<u8>,
}

impl Xid {
    pub fn new(format: i32, global_id: impl Into<Vec<u8>>, branch_id: impl Into<Vec<u8>>) -> Self {
        Self {
            format,
            global_id: global_id.into(),
            branch_id: branch_id.into(),
        }
    }
}

fn write_hex(f: &mut fmt::Formatter<'_>, bytes: &[u8]) -> fmt::Result {
    for b in bytes {
        write!(f, "{:02x}", b)?;
    }
    Ok(())
}

impl fmt::Display for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.format)?;
        write_hex(f, &self.global_id)?;
        f.write_str(":")?;
        write_hex(f, &self.branch_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_display_is_hex() {
        let xid = Xid::new(1, vec![0x0a, 0xff], b"b".to_vec());
        assert_eq!(xid.to_string(), "1:0aff:62");
    }

    #[test]
    fn test_equality_covers_all_parts() {
        let a = Xid::new(1, b"g".to_vec(), b"b1".to_vec());
        let b = Xid::new(1, b"g".to_vec(), b"b2".to_vec());
        let c = Xid::new(2, b"g".to_vec(), b"b1".to_vec());

        let set: HashSet<Xid> = [a.clone(), b, c, a].into_iter().collect();
        assert_eq!(set.len(), 3);
    }
}
