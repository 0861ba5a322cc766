//! Category registry: the only writer of category rows.

use tracing::{debug, info};

use crate::{
    error::{VideoError, VideoResult},
    metadata::{Category, MetadataStore},
};

/// Folding used for every case-insensitive category comparison, both here and
/// in the `name_key` column of the store.
pub fn category_key(name: &str) -> String {
    name.trim().to_lowercase()
}

#[derive(Debug, Clone)]
pub struct CategoryRegistry {
    store: MetadataStore,
}

impl CategoryRegistry {
    pub fn new(store: MetadataStore) -> Self {
        Self { store }
    }

    pub async fn get_all(&self) -> VideoResult<Vec<Category>> {
        self.store.call(|store| store.list_categories()).await
    }

    /// Returns the category whose name matches `name` ignoring case and
    /// surrounding whitespace, creating it with the trimmed name if none
    /// exists. An existing row is never renamed.
    pub async fn get_or_create(&self, name: &str) -> VideoResult<Category> {
        let name = name.trim().to_string();
        if name.is_empty() {
            return Err(VideoError::invalid_input("Name is required"));
        }
        let key = category_key(&name);

        self.store
            .call(move |store| {
                if let Some(existing) = store.find_category_by_key(&key)? {
                    debug!(id = existing.id, name = %existing.name, "category already exists");
                    return Ok(existing);
                }
                let category = store.insert_category(&name, &key)?;
                info!(id = category.id, name = %category.name, "category resolved");
                Ok(category)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{TempDir, tempdir};

    fn registry() -> (TempDir, CategoryRegistry) {
        let temp = tempdir().unwrap();
        let store = MetadataStore::open(temp.path().join("videohub.db")).unwrap();
        (temp, CategoryRegistry::new(store))
    }

    #[tokio::test]
    async fn get_or_create_ignores_case() {
        let (_temp, registry) = registry();
        let first = registry.get_or_create("Test").await.unwrap();
        let second = registry.get_or_create("test").await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.name, "Test");
        assert_eq!(registry.get_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn get_or_create_trims_names() {
        let (_temp, registry) = registry();
        let created = registry.get_or_create("  Travel \t").await.unwrap();
        assert_eq!(created.name, "Travel");
        let again = registry.get_or_create("TRAVEL").await.unwrap();
        assert_eq!(created.id, again.id);
    }

    #[tokio::test]
    async fn get_or_create_rejects_blank_names() {
        let (_temp, registry) = registry();
        let err = registry.get_or_create("   ").await.unwrap_err();
        assert!(matches!(err, VideoError::InvalidInput(_)));
        assert!(registry.get_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn get_all_sorts_by_name() {
        let (_temp, registry) = registry();
        for name in ["Banana", "Apple", "Cherry"] {
            registry.get_or_create(name).await.unwrap();
        }
        let names: Vec<String> = registry
            .get_all()
            .await
            .unwrap()
            .into_iter()
            .map(|category| category.name)
            .collect();
        assert_eq!(names, vec!["Apple", "Banana", "Cherry"]);
    }

    #[tokio::test]
    async fn concurrent_creations_converge_on_one_row() {
        let (_temp, registry) = registry();
        let names = ["Gaming", "GAMING", "gaming", "GaMiNg"];
        let handles: Vec<_> = names
            .iter()
            .map(|name| {
                let registry = registry.clone();
                let name = name.to_string();
                tokio::spawn(async move { registry.get_or_create(&name).await })
            })
            .collect();

        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap().unwrap().id);
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);
        assert_eq!(registry.get_all().await.unwrap().len(), 1);
    }

    #[test]
    fn category_key_folds_unicode() {
        assert_eq!(category_key(" Über "), "über");
    }
}
