//! ListTiersHandler - Query handler for the tier catalog.

use std::sync::Arc;

use crate::domain::billing::{TierCatalog, TierConfig};

pub struct ListTiersHandler {
    catalog: Arc<TierCatalog>,
}

impl ListTiersHandler {
    pub fn new(catalog: Arc<TierCatalog>) -> Self {
        Self { catalog }
    }

    /// All tiers in rank order.
    pub fn handle(&self) -> Vec<TierConfig> {
        self.catalog.tiers().into_iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::billing::{test_catalog, TierId};

    #[test]
    fn lists_tiers_in_rank_order() {
        let tiers = ListTiersHandler::new(Arc::new(test_catalog())).handle();
        let ids: Vec<TierId> = tiers.iter().map(|t| t.id).collect();
        assert_eq!(ids, TierId::ALL.to_vec());
    }
}
