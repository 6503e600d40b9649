//! A hand-built [`ModelInfo`] double, standing in for the real schema-to-model-graph builder that
//! lives outside this crate. Enough to exercise the compiler end to end without parsing any schema
//! documents.

use std::collections::HashMap;

use flexdb_compiler::model::{FieldInfo, ModelInfo, PrimarySortField, RelationInfo, RootEntityInfo};

pub struct TestField {
    pub name: String,
    pub system: bool,
    pub flex_search_indexed: bool,
    pub analyzer_language: Option<String>,
}

impl TestField {
    pub fn new(name: &str) -> Self {
        TestField {
            name: name.to_string(),
            system: false,
            flex_search_indexed: false,
            analyzer_language: None,
        }
    }

    pub fn flex_search(mut self, language: Option<&str>) -> Self {
        self.flex_search_indexed = true;
        self.analyzer_language = language.map(str::to_string);
        self
    }
}

impl FieldInfo for TestField {
    fn name(&self) -> &str {
        &self.name
    }
    fn is_system_field(&self) -> bool {
        self.system
    }
    fn is_flex_search_indexed(&self) -> bool {
        self.flex_search_indexed
    }
    fn analyzer_language(&self) -> Option<&str> {
        self.analyzer_language.as_deref()
    }
}

pub struct TestRootEntity {
    pub collection: String,
    pub flex_search_indexed: bool,
    pub primary_sort: Vec<PrimarySortField>,
    pub fields: HashMap<String, TestField>,
}

impl TestRootEntity {
    pub fn new(collection: &str) -> Self {
        TestRootEntity {
            collection: collection.to_string(),
            flex_search_indexed: false,
            primary_sort: Vec::new(),
            fields: HashMap::new(),
        }
    }

    pub fn with_field(mut self, field: TestField) -> Self {
        self.fields.insert(field.name.clone(), field);
        self
    }

    pub fn flex_searchable(mut self) -> Self {
        self.flex_search_indexed = true;
        self
    }
}

impl RootEntityInfo for TestRootEntity {
    fn collection_name(&self) -> &str {
        &self.collection
    }
    fn is_flex_search_indexed(&self) -> bool {
        self.flex_search_indexed
    }
    fn primary_sort(&self) -> &[PrimarySortField] {
        &self.primary_sort
    }
    fn field(&self, name: &str) -> Option<&dyn FieldInfo> {
        self.fields.get(name).map(|f| f as &dyn FieldInfo)
    }
}

pub struct TestRelation {
    pub edge_collection: String,
}

impl RelationInfo for TestRelation {
    fn edge_collection_name(&self) -> &str {
        &self.edge_collection
    }
}

#[derive(Default)]
pub struct TestModel {
    entities: HashMap<String, TestRootEntity>,
    relations: HashMap<String, TestRelation>,
}

impl TestModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entity(mut self, type_name: &str, entity: TestRootEntity) -> Self {
        self.entities.insert(type_name.to_string(), entity);
        self
    }

    pub fn with_relation(mut self, relation_name: &str, edge_collection: &str) -> Self {
        self.relations.insert(
            relation_name.to_string(),
            TestRelation { edge_collection: edge_collection.to_string() },
        );
        self
    }
}

impl ModelInfo for TestModel {
    fn root_entity(&self, type_name: &str) -> Option<&dyn RootEntityInfo> {
        self.entities.get(type_name).map(|e| e as &dyn RootEntityInfo)
    }
    fn relation(&self, relation_name: &str) -> Option<&dyn RelationInfo> {
        self.relations.get(relation_name).map(|r| r as &dyn RelationInfo)
    }
}

/// A deliveries-and-items schema, shared by most scenario tests: one flex-searchable `Delivery`
/// root entity, one plain `Item` root entity, and a `delivery_items` relation between them.
pub fn deliveries_schema() -> TestModel {
    TestModel::new()
        .with_entity(
            "Delivery",
            TestRootEntity::new("deliveries")
                .flex_searchable()
                .with_field(TestField::new("deliveryNumber"))
                .with_field(TestField::new("description").flex_search(Some("EN"))),
        )
        .with_entity("Item", TestRootEntity::new("items"))
        .with_relation("delivery_items", "delivery_items_edges")
}
