//! Synchronous class queries

use crate::error::{Error, Result};
use crate::namespace::QualifiedName;
use crate::provider::{ClassObject, QueryFlags, Timeout};
use crate::session::Session;
use crate::tree::ValueTree;

/// `SELECT * FROM <class>`
pub fn select_all(class: &str) -> String {
    format!("SELECT * FROM {}", class)
}

impl Session {
    /// Every instance of `qualified` (`[namespace\]Class`), in the order the
    /// provider returns them.
    ///
    /// Blocks until the enumerator is exhausted; each row is waited for
    /// without a timeout.
    pub fn query(&self, qualified: &str) -> Result<Vec<Box<dyn ClassObject>>> {
        let name = QualifiedName::parse(qualified)?;
        let services = self.resolve_namespace(&name)?;
        let query = select_all(name.class());

        let mut enumerator = services
            .exec_query(
                &self.config().query_language,
                &query,
                QueryFlags::FORWARD_ONLY | QueryFlags::RETURN_IMMEDIATELY,
            )
            .map_err(|code| {
                let err = Error::Query { query: query.clone(), code };
                log::error!("{}", err);
                err
            })?;

        let mut objects = Vec::new();
        loop {
            match enumerator.next_object(Timeout::Infinite) {
                Ok(Some(object)) => objects.push(object),
                Ok(None) => break,
                Err(code) => {
                    log::debug!("Enumeration of {} ended: error code = {}", name, code);
                    break;
                }
            }
        }

        log::debug!("{} returned {} objects", query, objects.len());
        Ok(objects)
    }

    /// [`Session::query`] followed by [`Marshaler::to_tree`] on every row.
    ///
    /// Rows whose properties cannot be enumerated are skipped.
    ///
    /// [`Marshaler::to_tree`]: crate::marshal::Marshaler::to_tree
    pub fn query_trees(&self, qualified: &str) -> Result<Vec<ValueTree>> {
        let objects = self.query(qualified)?;
        Ok(objects
            .iter()
            .filter_map(|object| match self.marshaler().to_tree(object.as_ref()) {
                Ok(tree) => Some(tree),
                Err(err) => {
                    log::warn!("Skipping {} row: {}", qualified, err);
                    None
                }
            })
            .collect())
    }
}
