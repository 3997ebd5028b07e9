//! Well-known unit and routine names.
//!
//! The instrumenter never assumes an on-disk container format, but it does
//! rely on a small namespace convention: platform built-ins live under
//! `core/`, and the two runtime-facing units (`strand/Coroutine` and the
//! sentinel signal type `strand/Suspend`) are recognised by name.

/// Namespace prefix of platform built-in units. Nothing under this prefix
/// is ever suspendable.
pub const PLATFORM_PREFIX: &str = "core/";

/// The root of every ancestry chain.
pub const OBJECT_ROOT: &str = "core/Object";

/// The designated base exception type. A unit is an exception type iff its
/// parent walk reaches this name before [`OBJECT_ROOT`].
pub const BASE_EXCEPTION: &str = "core/Exception";

/// The unit that hosts the suspend primitive.
pub const COROUTINE_UNIT: &str = "strand/Coroutine";

/// The suspend primitive itself. A static call to
/// `strand/Coroutine::yield` is the explicit "pause here" suspension point.
pub const YIELD_ROUTINE: &str = "yield";

/// The sentinel suspension signal type. User code must never catch it;
/// the instrumenter rejects any routine with a catch clause naming it.
pub const SUSPEND_SIGNAL: &str = "strand/Suspend";

/// Unit name assigned to string constants.
pub const STRING_UNIT: &str = "core/String";

/// Routine names starting with this marker are construction/initialization
/// routines: never suspendable, never instrumentable.
pub const SPECIAL_MARKER: char = '<';

/// Returns `true` for construction/initialization routine names.
pub fn is_special(routine: &str) -> bool {
    routine.starts_with(SPECIAL_MARKER)
}

/// Returns `true` for platform built-in units.
pub fn is_platform(unit: &str) -> bool {
    unit.starts_with(PLATFORM_PREFIX)
}

/// Returns `true` if `unit` names an array type (trailing `[]`).
pub fn is_array(unit: &str) -> bool {
    unit.ends_with("[]")
}

/// Strip one array dimension: `"core/String[][]"` → `"core/String[]"`.
pub fn element_type(unit: &str) -> Option<&str> {
    unit.strip_suffix("[]")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn special_marker() {
        assert!(is_special("<init>"));
        assert!(!is_special("run"));
    }

    #[test]
    fn array_names() {
        assert!(is_array("core/String[]"));
        assert_eq!(element_type("a/B[][]"), Some("a/B[]"));
        assert_eq!(element_type("a/B"), None);
    }
}
