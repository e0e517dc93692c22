//! Extension filtering.
//!
//! Each context records which of its driver's extensions are exposed and
//! which were hidden. Extensions are hidden when named in
//! [`WglParameters::disabled_extensions`](crate::WglParameters), and buffer
//! storage is always hidden for narrow callers since persistent mappings
//! cannot be served through a copy.

use crate::driver::PointerWidth;
use crate::params::WglParameters;

/// Extensions hidden from callers with a narrower pointer width.
pub const NARROW_UNSUPPORTED: &[&str] = &["GL_ARB_buffer_storage", "GL_EXT_buffer_storage"];

/// Enabled and disabled extensions of a context.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtensionList {
    enabled: Vec<String>,
    disabled: Vec<String>,
}

impl ExtensionList {
    /// Get the extensions exposed to the caller.
    pub fn enabled(&self) -> &[String] {
        &self.enabled
    }

    /// Get the extensions hidden from the caller.
    pub fn disabled(&self) -> &[String] {
        &self.disabled
    }

    /// Whether `name` is exposed.
    pub fn is_enabled(&self, name: &str) -> bool {
        self.enabled.iter().any(|e| e == name)
    }

    /// Get the exposed extensions as a space separated string.
    pub fn to_extension_string(&self) -> String {
        self.enabled.join(" ")
    }
}

/// Splits driver extension lists into enabled and disabled sets.
#[derive(Debug, Clone, Default)]
pub struct ExtensionFilter {
    disabled: Vec<String>,
}

impl ExtensionFilter {
    /// Build a filter from instance parameters.
    pub fn new(params: &WglParameters) -> Self {
        let mut disabled = params.disabled_extensions.clone();
        if params.pointer_width.is_narrow() {
            disabled.extend(NARROW_UNSUPPORTED.iter().map(|name| name.to_string()));
        }
        Self { disabled }
    }

    /// Build a filter hiding exactly `names`.
    pub fn hiding<I, S>(names: I, width: PointerWidth) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(
            &WglParameters::new()
                .with_pointer_width(width)
                .with_disabled_extensions(names),
        )
    }

    /// Split `available` into enabled and disabled lists.
    pub fn apply<S: AsRef<str>>(&self, available: &[S]) -> ExtensionList {
        let mut list = ExtensionList::default();
        for name in available.iter().map(AsRef::as_ref) {
            if self.disabled.iter().any(|d| d == name) {
                log::trace!("ExtensionFilter: hiding {}", name);
                list.disabled.push(name.to_string());
            } else {
                list.enabled.push(name.to_string());
            }
        }
        list
    }
}
