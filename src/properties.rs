//! Client library identification properties advertised on every connection,
//! mirroring the four keys Azure's AMQP clients attach to `Open.properties`.

use fe2o3_amqp_types::definitions::Fields;
use fe2o3_amqp_types::primitives::{Symbol, Value};

/// `(name, version, framework, platform)` advertised on connection open.
#[derive(Debug, Clone)]
pub struct ClientLibraryProperties {
    pub product: String,
    pub version: String,
    pub platform: String,
    pub framework: String,
}

impl ClientLibraryProperties {
    pub fn current() -> Self {
        ClientLibraryProperties {
            product: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            platform: std::env::consts::OS.to_string(),
            framework: format!("rustc/{}", rustc_marker()),
        }
    }

    pub fn into_fields(self) -> Fields {
        let mut fields = Fields::default();
        fields.insert(Symbol::from("product"), Value::String(self.product));
        fields.insert(Symbol::from("version"), Value::String(self.version));
        fields.insert(Symbol::from("platform"), Value::String(self.platform));
        fields.insert(Symbol::from("framework"), Value::String(self.framework));
        fields
    }
}

/// `rustc` doesn't expose its own version without a build script; fall back
/// to the MSRV declared in `Cargo.toml` when present.
fn rustc_marker() -> &'static str {
    option_env!("CARGO_PKG_RUST_VERSION").unwrap_or("unknown")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_properties_are_non_empty() {
        let props = ClientLibraryProperties::current();
        assert!(!props.product.is_empty());
        assert!(!props.version.is_empty());
        assert!(!props.platform.is_empty());
    }

    #[test]
    fn into_fields_carries_all_four_keys() {
        let fields = ClientLibraryProperties::current().into_fields();
        for key in ["product", "version", "platform", "framework"] {
            assert!(fields.get(&Symbol::from(key)).is_some());
        }
    }
}
