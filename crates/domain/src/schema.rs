use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tessera_core::{AppError, AppResult, NonEmptyString};

/// Supported column types of a collection field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    /// Short UTF-8 string.
    String,
    /// Long UTF-8 text.
    Text,
    /// 32-bit integer.
    Integer,
    /// 64-bit integer.
    BigInteger,
    /// Floating point number.
    Float,
    /// Boolean flag.
    Boolean,
    /// UUID value.
    Uuid,
    /// Date without time.
    Date,
    /// Timestamp.
    DateTime,
    /// Arbitrary JSON document.
    Json,
    /// Virtual field without a column (one-to-many alias).
    Alias,
}

impl FieldType {
    /// Returns a stable storage value for the field type.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Text => "text",
            Self::Integer => "integer",
            Self::BigInteger => "big_integer",
            Self::Float => "float",
            Self::Boolean => "boolean",
            Self::Uuid => "uuid",
            Self::Date => "date",
            Self::DateTime => "date_time",
            Self::Json => "json",
            Self::Alias => "alias",
        }
    }

    /// Returns whether the type stores character data.
    #[must_use]
    pub fn is_textual(self) -> bool {
        matches!(self, Self::String | Self::Text)
    }

    /// Returns whether the type stores numbers.
    #[must_use]
    pub fn is_numeric(self) -> bool {
        matches!(self, Self::Integer | Self::BigInteger | Self::Float)
    }

    /// Returns whether date-part functions apply to the type.
    #[must_use]
    pub fn is_temporal(self) -> bool {
        matches!(self, Self::Date | Self::DateTime)
    }

    /// Returns whether values of the type have a meaningful order.
    #[must_use]
    pub fn is_ordered(self) -> bool {
        !matches!(self, Self::Boolean | Self::Json | Self::Alias)
    }

    /// Returns whether the type is backed by a physical column.
    #[must_use]
    pub fn has_column(self) -> bool {
        self != Self::Alias
    }
}

impl FromStr for FieldType {
    type Err = AppError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "string" => Ok(Self::String),
            "text" => Ok(Self::Text),
            "integer" => Ok(Self::Integer),
            "big_integer" => Ok(Self::BigInteger),
            "float" => Ok(Self::Float),
            "boolean" => Ok(Self::Boolean),
            "uuid" => Ok(Self::Uuid),
            "date" => Ok(Self::Date),
            "date_time" => Ok(Self::DateTime),
            "json" => Ok(Self::Json),
            "alias" => Ok(Self::Alias),
            _ => Err(AppError::Validation(format!(
                "unknown field type '{value}'"
            ))),
        }
    }
}

/// Special handling flags attached to a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldSpecial {
    /// Stored as a one-way hash.
    Hash,
    /// Never shown in clear text.
    Conceal,
}

/// Schema definition of one field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDefinition {
    name: NonEmptyString,
    field_type: FieldType,
    #[serde(default)]
    nullable: bool,
    #[serde(default)]
    generated: bool,
    #[serde(default)]
    special: BTreeSet<FieldSpecial>,
}

impl FieldDefinition {
    /// Creates a nullable, non-generated field.
    pub fn new(name: impl Into<String>, field_type: FieldType) -> AppResult<Self> {
        Ok(Self {
            name: NonEmptyString::new(name)?,
            field_type,
            nullable: true,
            generated: false,
            special: BTreeSet::new(),
        })
    }

    /// Sets the nullable flag.
    #[must_use]
    pub fn with_nullable(mut self, nullable: bool) -> Self {
        self.nullable = nullable;
        self
    }

    /// Sets the generated flag.
    #[must_use]
    pub fn with_generated(mut self, generated: bool) -> Self {
        self.generated = generated;
        self
    }

    /// Adds a special flag.
    #[must_use]
    pub fn with_special(mut self, special: FieldSpecial) -> Self {
        self.special.insert(special);
        self
    }

    /// Returns the field name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    /// Returns the field type.
    #[must_use]
    pub fn field_type(&self) -> FieldType {
        self.field_type
    }

    /// Returns whether the column accepts null.
    #[must_use]
    pub fn nullable(&self) -> bool {
        self.nullable
    }

    /// Returns whether the column is generated by the database.
    #[must_use]
    pub fn generated(&self) -> bool {
        self.generated
    }

    /// Returns special flags.
    #[must_use]
    pub fn special(&self) -> &BTreeSet<FieldSpecial> {
        &self.special
    }

    /// Returns whether the stored value must never be compared as text.
    #[must_use]
    pub fn is_concealed(&self) -> bool {
        self.special.contains(&FieldSpecial::Hash) || self.special.contains(&FieldSpecial::Conceal)
    }
}

#[derive(Deserialize)]
struct CollectionSchemaDocument {
    name: String,
    primary_key: String,
    fields: Vec<FieldDefinition>,
    #[serde(default)]
    system: bool,
}

/// Schema of one collection (table).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "CollectionSchemaDocument")]
pub struct CollectionSchema {
    name: NonEmptyString,
    primary_key: String,
    fields: BTreeMap<String, FieldDefinition>,
    system: bool,
}

impl CollectionSchema {
    /// Creates a validated collection schema.
    pub fn new(
        name: impl Into<String>,
        primary_key: impl Into<String>,
        fields: Vec<FieldDefinition>,
    ) -> AppResult<Self> {
        let name = NonEmptyString::new(name)?;
        let primary_key = primary_key.into();

        let mut by_name = BTreeMap::new();
        for field in fields {
            let field_name = field.name().to_owned();
            if by_name.insert(field_name.clone(), field).is_some() {
                return Err(AppError::Validation(format!(
                    "duplicate field '{field_name}' in collection '{}'",
                    name.as_str()
                )));
            }
        }

        match by_name.get(&primary_key) {
            Some(field) if field.field_type().has_column() => {}
            _ => {
                return Err(AppError::Validation(format!(
                    "primary key '{primary_key}' is not a column of collection '{}'",
                    name.as_str()
                )));
            }
        }

        Ok(Self {
            name,
            primary_key,
            fields: by_name,
            system: false,
        })
    }

    /// Marks the collection as a system collection.
    #[must_use]
    pub fn with_system(mut self, system: bool) -> Self {
        self.system = system;
        self
    }

    /// Returns the collection name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    /// Returns the primary key field name.
    #[must_use]
    pub fn primary_key(&self) -> &str {
        self.primary_key.as_str()
    }

    /// Returns the primary key field definition.
    pub fn primary_key_field(&self) -> AppResult<&FieldDefinition> {
        self.fields.get(&self.primary_key).ok_or_else(|| {
            AppError::Internal(format!(
                "collection '{}' lost its primary key field",
                self.name()
            ))
        })
    }

    /// Looks up a field by name.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&FieldDefinition> {
        self.fields.get(name)
    }

    /// Iterates fields in name order.
    pub fn fields(&self) -> impl Iterator<Item = &FieldDefinition> {
        self.fields.values()
    }

    /// Returns whether the collection is a system collection.
    ///
    /// System collections carry a fixed permission set and never receive
    /// shadow relation checks.
    #[must_use]
    pub fn is_system(&self) -> bool {
        self.system
    }
}

impl TryFrom<CollectionSchemaDocument> for CollectionSchema {
    type Error = AppError;

    fn try_from(document: CollectionSchemaDocument) -> Result<Self, Self::Error> {
        Ok(Self::new(document.name, document.primary_key, document.fields)?
            .with_system(document.system))
    }
}

/// Cardinality of a relation seen from the field that owns it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationKind {
    /// Foreign key on this collection pointing at one related row.
    ManyToOne,
    /// Alias field listing related rows whose foreign key points here.
    OneToMany,
    /// Foreign key whose target collection is stored in a sibling field.
    AnyToOne,
}

impl RelationKind {
    /// Returns stable storage value.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ManyToOne => "many_to_one",
            Self::OneToMany => "one_to_many",
            Self::AnyToOne => "any_to_one",
        }
    }
}

/// Relation owned by `(collection, field)`.
///
/// * many-to-one: `field` is a foreign key to `related_collection.related_field`.
/// * one-to-many: `field` is an alias; rows of `related_collection` reference
///   this collection's primary key through `related_field`.
/// * any-to-one: `field` stores a key of one of `allowed_collections`, chosen
///   per row by `collection_field`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relation {
    kind: RelationKind,
    collection: String,
    field: String,
    #[serde(default)]
    related_collection: Option<String>,
    #[serde(default)]
    related_field: Option<String>,
    #[serde(default)]
    collection_field: Option<String>,
    #[serde(default)]
    allowed_collections: Vec<String>,
}

impl Relation {
    /// Creates a many-to-one relation.
    #[must_use]
    pub fn many_to_one(
        collection: impl Into<String>,
        field: impl Into<String>,
        related_collection: impl Into<String>,
        related_field: impl Into<String>,
    ) -> Self {
        Self {
            kind: RelationKind::ManyToOne,
            collection: collection.into(),
            field: field.into(),
            related_collection: Some(related_collection.into()),
            related_field: Some(related_field.into()),
            collection_field: None,
            allowed_collections: Vec::new(),
        }
    }

    /// Creates a one-to-many relation exposed through an alias field.
    #[must_use]
    pub fn one_to_many(
        collection: impl Into<String>,
        alias_field: impl Into<String>,
        related_collection: impl Into<String>,
        foreign_key: impl Into<String>,
    ) -> Self {
        Self {
            kind: RelationKind::OneToMany,
            collection: collection.into(),
            field: alias_field.into(),
            related_collection: Some(related_collection.into()),
            related_field: Some(foreign_key.into()),
            collection_field: None,
            allowed_collections: Vec::new(),
        }
    }

    /// Creates an any-to-one relation.
    #[must_use]
    pub fn any_to_one(
        collection: impl Into<String>,
        field: impl Into<String>,
        collection_field: impl Into<String>,
        allowed_collections: Vec<String>,
    ) -> Self {
        Self {
            kind: RelationKind::AnyToOne,
            collection: collection.into(),
            field: field.into(),
            related_collection: None,
            related_field: None,
            collection_field: Some(collection_field.into()),
            allowed_collections,
        }
    }

    /// Returns relation kind.
    #[must_use]
    pub fn kind(&self) -> RelationKind {
        self.kind
    }

    /// Returns the owning collection.
    #[must_use]
    pub fn collection(&self) -> &str {
        self.collection.as_str()
    }

    /// Returns the owning field.
    #[must_use]
    pub fn field(&self) -> &str {
        self.field.as_str()
    }

    /// Returns the related collection for single-target relations.
    #[must_use]
    pub fn related_collection(&self) -> Option<&str> {
        self.related_collection.as_deref()
    }

    /// Returns the referenced field (many-to-one) or the foreign key (one-to-many).
    #[must_use]
    pub fn related_field(&self) -> Option<&str> {
        self.related_field.as_deref()
    }

    /// Returns the sibling field naming the target collection (any-to-one).
    #[must_use]
    pub fn collection_field(&self) -> Option<&str> {
        self.collection_field.as_deref()
    }

    /// Returns allowed target collections (any-to-one).
    #[must_use]
    pub fn allowed_collections(&self) -> &[String] {
        &self.allowed_collections
    }
}

#[derive(Deserialize)]
struct SchemaOverviewDocument {
    collections: Vec<CollectionSchema>,
    #[serde(default)]
    relations: Vec<Relation>,
}

/// Immutable schema snapshot used for one request.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "SchemaOverviewDocument")]
pub struct SchemaOverview {
    collections: BTreeMap<String, CollectionSchema>,
    relations: Vec<Relation>,
}

impl SchemaOverview {
    /// Creates a validated schema snapshot.
    pub fn new(collections: Vec<CollectionSchema>, relations: Vec<Relation>) -> AppResult<Self> {
        let mut by_name = BTreeMap::new();
        for collection in collections {
            let name = collection.name().to_owned();
            if by_name.insert(name.clone(), collection).is_some() {
                return Err(AppError::Validation(format!(
                    "duplicate collection '{name}'"
                )));
            }
        }

        let overview = Self {
            collections: by_name,
            relations,
        };
        overview.validate_relations()?;
        Ok(overview)
    }

    /// Looks up a collection by name.
    #[must_use]
    pub fn collection(&self, name: &str) -> Option<&CollectionSchema> {
        self.collections.get(name)
    }

    /// Iterates collections in name order.
    pub fn collections(&self) -> impl Iterator<Item = &CollectionSchema> {
        self.collections.values()
    }

    /// Returns all relations.
    #[must_use]
    pub fn relations(&self) -> &[Relation] {
        &self.relations
    }

    /// Returns the relation owned by `collection.field`.
    #[must_use]
    pub fn relation(&self, collection: &str, field: &str) -> Option<&Relation> {
        self.relations
            .iter()
            .find(|relation| relation.collection() == collection && relation.field() == field)
    }

    fn validate_relations(&self) -> AppResult<()> {
        let mut owners = BTreeSet::new();
        let mut inverse_sides = BTreeSet::new();

        for relation in &self.relations {
            let owner = self.collection(relation.collection()).ok_or_else(|| {
                AppError::Validation(format!(
                    "relation references unknown collection '{}'",
                    relation.collection()
                ))
            })?;
            if owner.field(relation.field()).is_none() {
                return Err(AppError::Validation(format!(
                    "relation references unknown field '{}.{}'",
                    relation.collection(),
                    relation.field()
                )));
            }
            if !owners.insert((relation.collection(), relation.field())) {
                return Err(AppError::Validation(format!(
                    "field '{}.{}' owns more than one relation",
                    relation.collection(),
                    relation.field()
                )));
            }

            match relation.kind() {
                RelationKind::ManyToOne => {
                    let (related, related_field) = self.related_endpoint(relation)?;
                    if related.primary_key() != related_field {
                        return Err(AppError::Validation(format!(
                            "many-to-one '{}.{}' must reference the primary key of '{}'",
                            relation.collection(),
                            relation.field(),
                            related.name()
                        )));
                    }
                }
                RelationKind::OneToMany => {
                    let (related, foreign_key) = self.related_endpoint(relation)?;
                    let inverse = self.relation(related.name(), foreign_key);
                    let matches_inverse = inverse.is_some_and(|inverse| {
                        inverse.kind() == RelationKind::ManyToOne
                            && inverse.related_collection() == Some(relation.collection())
                    });
                    if !matches_inverse {
                        return Err(AppError::Validation(format!(
                            "one-to-many '{}.{}' has no many-to-one counterpart on '{}.{}'",
                            relation.collection(),
                            relation.field(),
                            related.name(),
                            foreign_key
                        )));
                    }
                    if !inverse_sides.insert((related.name(), foreign_key)) {
                        return Err(AppError::Validation(format!(
                            "many-to-one '{}.{}' has more than one one-to-many counterpart",
                            related.name(),
                            foreign_key
                        )));
                    }
                }
                RelationKind::AnyToOne => {
                    let collection_field = relation.collection_field().ok_or_else(|| {
                        AppError::Validation(format!(
                            "any-to-one '{}.{}' needs a collection field",
                            relation.collection(),
                            relation.field()
                        ))
                    })?;
                    if owner.field(collection_field).is_none() {
                        return Err(AppError::Validation(format!(
                            "any-to-one collection field '{}.{}' does not exist",
                            relation.collection(),
                            collection_field
                        )));
                    }
                    if relation.allowed_collections().is_empty() {
                        return Err(AppError::Validation(format!(
                            "any-to-one '{}.{}' allows no collections",
                            relation.collection(),
                            relation.field()
                        )));
                    }
                    for allowed in relation.allowed_collections() {
                        if self.collection(allowed).is_none() {
                            return Err(AppError::Validation(format!(
                                "any-to-one '{}.{}' allows unknown collection '{allowed}'",
                                relation.collection(),
                                relation.field()
                            )));
                        }
                    }
                }
            }
        }

        Ok(())
    }

    fn related_endpoint<'a>(
        &'a self,
        relation: &'a Relation,
    ) -> AppResult<(&'a CollectionSchema, &'a str)> {
        let related_name = relation.related_collection().ok_or_else(|| {
            AppError::Validation(format!(
                "relation '{}.{}' needs a related collection",
                relation.collection(),
                relation.field()
            ))
        })?;
        let related = self.collection(related_name).ok_or_else(|| {
            AppError::Validation(format!(
                "relation '{}.{}' references unknown collection '{related_name}'",
                relation.collection(),
                relation.field()
            ))
        })?;
        let related_field = relation.related_field().ok_or_else(|| {
            AppError::Validation(format!(
                "relation '{}.{}' needs a related field",
                relation.collection(),
                relation.field()
            ))
        })?;
        if related.field(related_field).is_none() {
            return Err(AppError::Validation(format!(
                "relation '{}.{}' references unknown field '{}.{related_field}'",
                relation.collection(),
                relation.field(),
                related.name()
            )));
        }

        Ok((related, related_field))
    }
}

impl TryFrom<SchemaOverviewDocument> for SchemaOverview {
    type Error = AppError;

    fn try_from(document: SchemaOverviewDocument) -> Result<Self, Self::Error> {
        Self::new(document.collections, document.relations)
    }
}
