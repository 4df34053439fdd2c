//! Wire shapes for resource documents and relationship payloads.

use crate::identifier::ResourceRef;
use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Attribute bag. Key order follows payload insertion order.
pub type Attributes = serde_json::Map<String, Value>;

/// Relationship payloads by field, applied in payload order.
pub type Relationships = IndexMap<String, RelationshipPayload>;

/// `data` member of a relationship payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RelationshipData {
    Many(Vec<ResourceRef>),
    One(Option<ResourceRef>),
}

impl RelationshipData {
    pub fn members(&self) -> Vec<&ResourceRef> {
        match self {
            RelationshipData::Many(refs) => refs.iter().collect(),
            RelationshipData::One(one) => one.iter().collect(),
        }
    }

    /// `null` or `[]`
    pub fn is_empty(&self) -> bool {
        match self {
            RelationshipData::Many(refs) => refs.is_empty(),
            RelationshipData::One(one) => one.is_none(),
        }
    }

    pub fn is_many(&self) -> bool {
        matches!(self, RelationshipData::Many(_))
    }
}

/// A related link, either a bare URL or `{ "href": ... }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LinkValue {
    Href(String),
    Object {
        href: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        meta: Option<Value>,
    },
}

impl LinkValue {
    pub fn href(&self) -> &str {
        match self {
            LinkValue::Href(href) => href,
            LinkValue::Object { href, .. } => href,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Links {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub related: Option<LinkValue>,
    #[serde(default, rename = "self", skip_serializing_if = "Option::is_none")]
    pub self_link: Option<LinkValue>,
}

/// `{ data?, links?, meta? }`. Absent `data` is `None`; `data: null` is
/// `Some(RelationshipData::One(None))`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RelationshipPayload {
    #[serde(
        default,
        deserialize_with = "deserialize_present",
        skip_serializing_if = "Option::is_none"
    )]
    pub data: Option<RelationshipData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub links: Option<Links>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

impl RelationshipPayload {
    pub fn one(member: Option<ResourceRef>) -> Self {
        Self {
            data: Some(RelationshipData::One(member)),
            ..Default::default()
        }
    }

    pub fn many(members: Vec<ResourceRef>) -> Self {
        Self {
            data: Some(RelationshipData::Many(members)),
            ..Default::default()
        }
    }

    pub fn link<H: Into<String>>(href: H) -> Self {
        Self {
            links: Some(Links {
                related: Some(LinkValue::Href(href.into())),
                self_link: None,
            }),
            ..Default::default()
        }
    }

    pub fn with_link<H: Into<String>>(mut self, href: H) -> Self {
        self.links.get_or_insert_with(Links::default).related = Some(LinkValue::Href(href.into()));
        self
    }

    pub fn with_meta(mut self, meta: Value) -> Self {
        self.meta = Some(meta);
        self
    }

    pub fn related_link(&self) -> Option<&str> {
        self.links
            .as_ref()
            .and_then(|links| links.related.as_ref())
            .map(LinkValue::href)
    }
}

fn deserialize_present<'de, D>(deserializer: D) -> Result<Option<RelationshipData>, D::Error>
where
    D: Deserializer<'de>,
{
    RelationshipData::deserialize(deserializer).map(Some)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceDocument {
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attributes: Option<Attributes>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relationships: Option<Relationships>,
}

impl ResourceDocument {
    pub fn new<T: Into<String>, I: Into<String>>(type_name: T, id: I) -> Self {
        Self {
            type_name: type_name.into(),
            id: Some(id.into()),
            ..Default::default()
        }
    }

    pub fn with_attribute<K: Into<String>>(mut self, key: K, value: Value) -> Self {
        self.attributes
            .get_or_insert_with(Attributes::new)
            .insert(key.into(), value);
        self
    }

    pub fn with_relationship<F: Into<String>>(mut self, field: F, payload: RelationshipPayload) -> Self {
        self.relationships
            .get_or_insert_with(Relationships::new)
            .insert(field.into(), payload);
        self
    }

    pub fn resource_ref(&self) -> ResourceRef {
        ResourceRef {
            type_name: self.type_name.clone(),
            id: self.id.clone(),
            lid: self.lid.clone(),
        }
    }
}

/// Top-level payload: primary data plus side-loaded resources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub data: DocumentData,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub included: Vec<ResourceDocument>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DocumentData {
    Many(Vec<ResourceDocument>),
    One(Option<ResourceDocument>),
}

impl Document {
    /// Primary resources first, then included ones.
    pub fn into_resources(self) -> Vec<ResourceDocument> {
        let mut resources = match self.data {
            DocumentData::Many(docs) => docs,
            DocumentData::One(doc) => doc.into_iter().collect(),
        };
        resources.extend(self.included);
        resources
    }
}

/// Validation error reported by a rejected commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationError {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attribute: Option<String>,
    pub message: String,
}

impl ValidationError {
    pub fn on<A: Into<String>, M: Into<String>>(attribute: A, message: M) -> Self {
        Self {
            attribute: Some(attribute.into()),
            message: message.into(),
        }
    }
}
