use crate::config::DEFAULT_COUNTRY_QUALIFIER;

/// Canonical form of a free-text address used both as the geocoder query and
/// as the cache lookup text.
#[derive(Debug, Clone)]
pub struct AddressNormalizer {
    local_context: String,
    country_qualifier: String,
}

impl AddressNormalizer {
    pub fn new(local_context: &str, country_qualifier: &str) -> Self {
        Self {
            local_context: local_context.trim().to_uppercase(),
            country_qualifier: country_qualifier.trim().to_uppercase(),
        }
    }

    pub fn for_locality(local_context: &str) -> Self {
        Self::new(local_context, DEFAULT_COUNTRY_QUALIFIER)
    }

    pub fn local_context(&self) -> &str {
        &self.local_context
    }

    pub fn normalize(&self, raw: &str) -> String {
        let mut query = raw.trim().to_uppercase();
        if !query.contains(self.local_context.as_str()) {
            query.push_str(", ");
            query.push_str(&self.local_context);
        }
        if !query.contains(self.country_qualifier.as_str()) {
            query.push_str(", ");
            query.push_str(&self.country_qualifier);
        }
        query
    }
}
