//! Registry of predefined, parameterised safe queries.
//!
//! The planner may answer `use_predefined` with a query id instead of
//! drafting SQL. The catalog ships empty; deployments register entries at
//! startup.

use crate::domain::planner::{PlannerQuery, PredefinedQuery};

#[derive(Default)]
pub struct PredefinedQueryRegistry {
    queries: Vec<PredefinedQuery>,
}

impl PredefinedQueryRegistry {
    pub fn new(queries: Vec<PredefinedQuery>) -> Self {
        Self { queries }
    }

    pub fn all(&self) -> &[PredefinedQuery] {
        &self.queries
    }

    pub fn get(&self, id: &str) -> Option<&PredefinedQuery> {
        self.queries.iter().find(|query| query.id == id)
    }

    /// Materialises the registry entry as a planner query; the template
    /// still passes through validation like any drafted SQL.
    pub fn resolve(&self, id: &str) -> Option<PlannerQuery> {
        self.get(id).map(|query| PlannerQuery {
            name: query.intent.clone(),
            purpose: query.description.clone(),
            sql: query.sql_template.clone(),
            connection_id: None,
            expected_shape: None,
            safety: None,
        })
    }
}
