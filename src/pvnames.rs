//! PV name handling.
//!
//! Channel-access PV names may carry a field suffix (`ROOM:TEMP.HIHI`). The
//! engine keys every registry on the base name only; these helpers split the
//! two portions apart.

/// Returns the portion of a PV name before the first `.`.
pub fn base_name(pv_name: &str) -> &str {
    match pv_name.find('.') {
        Some(idx) => &pv_name[..idx],
        None => pv_name,
    }
}

/// Returns the field suffix of a PV name, if any.
///
/// `ROOM:TEMP.HIHI` yields `Some("HIHI")`; a bare base name yields `None`.
pub fn field_name(pv_name: &str) -> Option<&str> {
    pv_name
        .find('.')
        .map(|idx| &pv_name[idx + 1..])
        .filter(|f| !f.is_empty())
}
