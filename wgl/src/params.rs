//! Instance configuration.

use crate::driver::PointerWidth;

/// Default number of handle table slots.
pub const DEFAULT_CAPACITY: usize = 1024;

/// Environment variable overriding the handle table capacity.
pub const ENV_CAPACITY: &str = "WGL_HANDLE_CAPACITY";
/// Environment variable overriding the caller pointer width in bits.
pub const ENV_POINTER_WIDTH: &str = "WGL_POINTER_WIDTH";
/// Environment variable listing extensions to hide, comma or space separated.
pub const ENV_DISABLED_EXTENSIONS: &str = "WGL_DISABLED_EXTENSIONS";

/// Parameters for a [`Wgl`](crate::Wgl) instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WglParameters {
    /// Handle table capacity.
    pub capacity: usize,
    /// Pointer width of the callers.
    pub pointer_width: PointerWidth,
    /// Extensions hidden from every context.
    pub disabled_extensions: Vec<String>,
}

impl Default for WglParameters {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            pointer_width: PointerWidth::NATIVE,
            disabled_extensions: Vec::new(),
        }
    }
}

impl WglParameters {
    /// Create default parameters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the handle table capacity.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Set the caller pointer width.
    pub fn with_pointer_width(mut self, width: PointerWidth) -> Self {
        self.pointer_width = width;
        self
    }

    /// Set the extensions hidden from every context.
    pub fn with_disabled_extensions<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.disabled_extensions = names.into_iter().map(Into::into).collect();
        self
    }

    /// Read parameters from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read parameters through `lookup`, falling back to defaults.
    ///
    /// Unparseable values are logged and ignored.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut params = Self::default();

        if let Some(value) = lookup(ENV_CAPACITY) {
            match value.trim().parse::<usize>() {
                Ok(capacity) => params.capacity = capacity,
                Err(e) => log::warn!("Ignoring {}={:?}: {}", ENV_CAPACITY, value, e),
            }
        }

        if let Some(value) = lookup(ENV_POINTER_WIDTH) {
            match value.trim().parse::<u32>() {
                Ok(bits) => params.pointer_width = PointerWidth::new(bits),
                Err(e) => log::warn!("Ignoring {}={:?}: {}", ENV_POINTER_WIDTH, value, e),
            }
        }

        if let Some(value) = lookup(ENV_DISABLED_EXTENSIONS) {
            params.disabled_extensions = value
                .split(|c: char| c == ',' || c.is_whitespace())
                .filter(|name| !name.is_empty())
                .map(str::to_string)
                .collect();
        }

        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let params = WglParameters::from_lookup(lookup(&[]));
        assert_eq!(params, WglParameters::default());
        assert_eq!(params.capacity, DEFAULT_CAPACITY);
        assert!(!params.pointer_width.is_narrow());
    }

    #[test]
    fn test_builder() {
        let params = WglParameters::new()
            .with_capacity(16)
            .with_pointer_width(PointerWidth::BITS_32)
            .with_disabled_extensions(["GL_ARB_sync"]);
        assert_eq!(params.capacity, 16);
        assert_eq!(params.pointer_width.bits(), 32);
        assert_eq!(params.disabled_extensions, ["GL_ARB_sync"]);
    }

    #[test]
    fn test_from_lookup() {
        let params = WglParameters::from_lookup(lookup(&[
            (ENV_CAPACITY, " 64 "),
            (ENV_POINTER_WIDTH, "32"),
            (ENV_DISABLED_EXTENSIONS, "GL_A, GL_B GL_C"),
        ]));
        assert_eq!(params.capacity, 64);
        assert_eq!(params.pointer_width, PointerWidth::BITS_32);
        assert_eq!(params.disabled_extensions, ["GL_A", "GL_B", "GL_C"]);
    }

    #[test]
    fn test_bad_values_ignored() {
        let params = WglParameters::from_lookup(lookup(&[
            (ENV_CAPACITY, "lots"),
            (ENV_POINTER_WIDTH, "-1"),
        ]));
        assert_eq!(params.capacity, DEFAULT_CAPACITY);
        assert_eq!(params.pointer_width, PointerWidth::NATIVE);
    }
}
