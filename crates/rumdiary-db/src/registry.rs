//! The set of domain models.

use std::sync::Arc;

use futures::future::try_join_all;
use tokio_util::sync::CancellationToken;

use crate::connection::ConnectionManager;
use crate::error::DbError;
use crate::logger::Logger;
use crate::model::Model;
use crate::schemas;

/// Every domain model, in declaration order.
#[derive(Debug)]
pub struct Models {
    /// Page loads.
    pub page_view: Model,
    /// Tracked hostnames.
    pub site: Model,
    /// People who sign in.
    pub user: Model,
    /// Tags seen per site.
    pub tags: Model,
    /// Invitations to view a site.
    pub invite: Model,
    /// Notes on a site's history.
    pub annotation: Model,
}

impl Models {
    /// Define every model. None is usable until [`Models::init_all`].
    pub fn define() -> Self {
        Self {
            page_view: Model::define("pageView", schemas::page_view()),
            site: Model::define("site", schemas::site()),
            user: Model::define("user", schemas::user()),
            tags: Model::define("tags", schemas::tags()),
            invite: Model::define("invite", schemas::invite()),
            annotation: Model::define("annotation", schemas::annotation()),
        }
    }

    /// All models, in declaration order.
    pub const fn all(&self) -> [&Model; 6] {
        [
            &self.page_view,
            &self.site,
            &self.user,
            &self.tags,
            &self.invite,
            &self.annotation,
        ]
    }

    /// Look a model up by name.
    pub fn get(&self, name: &str) -> Option<&Model> {
        self.all().into_iter().find(|model| model.name() == name)
    }

    /// Apply `method` to every model and collect the individual results.
    pub fn invoke_method<'a, R>(&'a self, method: impl FnMut(&'a Model) -> R) -> Vec<R> {
        self.all().into_iter().map(method).collect()
    }

    /// Inject the shared connection and logger into every model.
    pub fn init_all(&self, connection: &Arc<ConnectionManager>, logger: &Arc<dyn Logger>) {
        self.invoke_method(|model| model.init(Arc::clone(connection), Arc::clone(logger)));
    }

    /// Clear every model concurrently, returning how many records each lost.
    ///
    /// # Errors
    ///
    /// Returns the first failure; the other clears are dropped.
    pub async fn clear_all(&self, cancel: &CancellationToken) -> Result<Vec<u64>, DbError> {
        try_join_all(self.invoke_method(|model| model.clear(cancel))).await
    }
}

impl Default for Models {
    fn default() -> Self {
        Self::define()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn models_in_declaration_order() {
        let models = Models::define();
        let names = models.invoke_method(|model| model.name().to_owned());
        assert_eq!(
            names,
            ["pageView", "site", "user", "tags", "invite", "annotation"]
        );
    }

    #[test]
    fn get_by_name() {
        let models = Models::define();
        assert_eq!(models.get("invite").map(Model::name), Some("invite"));
        assert!(models.get("nope").is_none());
    }
}
