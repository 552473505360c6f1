//! Collections of remote entities mirrored into the local store.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// A kind of remote entity, each synced from one list endpoint.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::None)")]
pub enum EntityCollection {
    #[sea_orm(string_value = "projects")]
    Projects,
    #[sea_orm(string_value = "issues")]
    Issues,
    #[sea_orm(string_value = "users")]
    Users,
}

impl EntityCollection {
    /// Remote list endpoint for this collection.
    pub fn endpoint(self) -> &'static str {
        match self {
            EntityCollection::Projects => "/projects",
            EntityCollection::Issues => "/issues",
            EntityCollection::Users => "/users/myself",
        }
    }

    /// Collection served by a remote endpoint, if any.
    pub fn from_endpoint(endpoint: &str) -> Option<Self> {
        match endpoint {
            "/projects" => Some(EntityCollection::Projects),
            "/issues" => Some(EntityCollection::Issues),
            "/users/myself" => Some(EntityCollection::Users),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EntityCollection::Projects => "projects",
            EntityCollection::Issues => "issues",
            EntityCollection::Users => "users",
        }
    }
}

impl std::fmt::Display for EntityCollection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EntityCollection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "projects" | "project" => Ok(EntityCollection::Projects),
            "issues" | "issue" => Ok(EntityCollection::Issues),
            "users" | "user" => Ok(EntityCollection::Users),
            _ => Err(format!("Unknown entity collection: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_round_trip() {
        for collection in [
            EntityCollection::Projects,
            EntityCollection::Issues,
            EntityCollection::Users,
        ] {
            assert_eq!(
                EntityCollection::from_endpoint(collection.endpoint()),
                Some(collection)
            );
        }
        assert_eq!(EntityCollection::from_endpoint("/rateLimit"), None);
    }

    #[test]
    fn test_from_str() {
        assert_eq!(
            "Issues".parse::<EntityCollection>().unwrap(),
            EntityCollection::Issues
        );
        assert_eq!(
            "project".parse::<EntityCollection>().unwrap(),
            EntityCollection::Projects
        );
        assert!("wiki".parse::<EntityCollection>().is_err());
    }
}
