//! Panel: the unit of caching and of data-endpoint requests.
//!
//! Grounded on `original_source/backend-server/app/command/coremodel.py::Panel`:
//! a `(stick, scale, index)` triple with derived `start`/`end`.

use ciborium::value::Value;

/// A half-open region `[start, end)` of a stick at a power-of-two scale.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Panel {
    pub stick: String,
    pub scale: u8,
    pub index: u64,
    pub start: u64,
    pub end: u64,
}

impl Panel {
    /// `scale` must be `< 63` per spec.md §3; callers validate stick bounds
    /// against file-reader results, not here (clipping is the readers' job).
    pub fn new(stick: String, scale: u8, index: u64) -> Self {
        let width = 1u64 << scale;
        Self {
            start: width * index,
            end: width * (index + 1),
            stick,
            scale,
            index,
        }
    }

    /// The canonical `[stick, scale, index]` encoding used both on the wire
    /// and as the panel component of a fingerprint/cache key.
    pub fn to_value(&self) -> Value {
        Value::Array(vec![
            Value::Text(self.stick.clone()),
            Value::Integer(self.scale.into()),
            Value::Integer(self.index.into()),
        ])
    }

    pub fn dumps(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        ciborium::ser::into_writer(&self.to_value(), &mut buf).expect("panel value always encodes");
        buf
    }

    pub fn from_triple(stick: String, scale: u8, index: u64) -> Result<Self, PanelError> {
        if scale >= 63 {
            return Err(PanelError::ScaleOutOfRange(scale));
        }
        Ok(Self::new(stick, scale, index))
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PanelError {
    #[error("scale {0} out of range [0, 63)")]
    ScaleOutOfRange(u8),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_start_and_end_from_scale_and_index() {
        let panel = Panel::new("chr1".into(), 4, 3);
        assert_eq!(panel.start, 48);
        assert_eq!(panel.end, 64);
    }

    #[test]
    fn rejects_scale_at_or_above_63() {
        assert_eq!(
            Panel::from_triple("chr1".into(), 63, 0).unwrap_err(),
            PanelError::ScaleOutOfRange(63)
        );
    }

    #[test]
    fn dumps_is_stable_for_equal_panels() {
        let a = Panel::new("chr1".into(), 2, 9).dumps();
        let b = Panel::new("chr1".into(), 2, 9).dumps();
        assert_eq!(a, b);
    }
}
