//! Endpoint descriptor table and path routing.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::ConfigError;
use crate::money::{check_bounded, COST_DECIMALS};

/// Every metered endpoint the gateway serves. Adding a variant forces a
/// handler to be written before the crate compiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointKind {
    RegionLookup,
    PriceQuote,
    TaxEstimate,
    UsageReport,
}

impl EndpointKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointKind::RegionLookup => "region_lookup",
            EndpointKind::PriceQuote => "price_quote",
            EndpointKind::TaxEstimate => "tax_estimate",
            EndpointKind::UsageReport => "usage_report",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
}

impl HttpMethod {
    pub fn parse(method: &str) -> Option<Self> {
        match method.to_ascii_uppercase().as_str() {
            "GET" => Some(HttpMethod::Get),
            "POST" => Some(HttpMethod::Post),
            "PUT" => Some(HttpMethod::Put),
            "DELETE" => Some(HttpMethod::Delete),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointRateLimit {
    pub limit: u64,
    pub window_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointDescriptor {
    pub kind: EndpointKind,
    pub method: HttpMethod,
    /// Path pattern with `{name}` placeholders, e.g. `/api/v1/pricing/{plan}`.
    pub pattern: String,
    pub category: String,
    /// Cost per successful call in usd, e.g. "0.0015".
    #[serde(with = "rust_decimal::serde::str")]
    pub cost: Decimal,
    pub rate_limit: EndpointRateLimit,
}

/// A descriptor matched against a concrete request path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedEndpoint<'a> {
    pub descriptor: &'a EndpointDescriptor,
    pub path_params: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
}

#[derive(Debug, Clone)]
pub struct EndpointTable {
    endpoints: Vec<(EndpointDescriptor, Vec<Segment>)>,
}

fn split_path(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

fn compile_pattern(pattern: &str) -> Result<Vec<Segment>, ConfigError> {
    if !pattern.starts_with('/') {
        return Err(ConfigError::Invalid(format!(
            "endpoint pattern {pattern:?} must start with '/'"
        )));
    }
    split_path(pattern)
        .map(|seg| match seg.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
            Some("") => Err(ConfigError::Invalid(format!(
                "empty placeholder in endpoint pattern {pattern:?}"
            ))),
            Some(name) => Ok(Segment::Param(name.to_string())),
            None => Ok(Segment::Literal(seg.to_string())),
        })
        .collect()
}

impl EndpointTable {
    pub fn new(descriptors: Vec<EndpointDescriptor>) -> Result<Self, ConfigError> {
        let mut endpoints = Vec::with_capacity(descriptors.len());
        for descriptor in descriptors {
            if descriptor.rate_limit.limit == 0 || descriptor.rate_limit.window_secs == 0 {
                return Err(ConfigError::Invalid(format!(
                    "endpoint {} needs a non-zero rate limit and window",
                    descriptor.kind.as_str()
                )));
            }
            if check_bounded(descriptor.cost, COST_DECIMALS).is_none() {
                return Err(ConfigError::InvalidAmount(format!(
                    "endpoint {} cost {}",
                    descriptor.kind.as_str(),
                    descriptor.cost
                )));
            }
            if endpoints
                .iter()
                .any(|(d, _): &(EndpointDescriptor, _)| d.kind == descriptor.kind)
            {
                return Err(ConfigError::Invalid(format!(
                    "endpoint {} declared twice",
                    descriptor.kind.as_str()
                )));
            }
            let segments = compile_pattern(&descriptor.pattern)?;
            endpoints.push((descriptor, segments));
        }
        Ok(Self { endpoints })
    }

    /// Match a method and path. Literal patterns win over placeholder
    /// patterns of the same length.
    pub fn resolve(&self, method: HttpMethod, path: &str) -> Option<ResolvedEndpoint<'_>> {
        let parts: Vec<&str> = split_path(path).collect();

        let mut best: Option<(usize, ResolvedEndpoint<'_>)> = None;
        for (descriptor, segments) in &self.endpoints {
            if descriptor.method != method || segments.len() != parts.len() {
                continue;
            }
            let mut params = HashMap::new();
            let mut literals = 0;
            let matched = segments.iter().zip(&parts).all(|(seg, part)| match seg {
                Segment::Literal(lit) => {
                    literals += 1;
                    lit == part
                }
                Segment::Param(name) => match urlencoding::decode(part) {
                    Ok(value) => {
                        params.insert(name.clone(), value.into_owned());
                        true
                    }
                    Err(_) => false,
                },
            });
            if matched && best.as_ref().is_none_or(|(score, _)| literals > *score) {
                best = Some((
                    literals,
                    ResolvedEndpoint {
                        descriptor,
                        path_params: params,
                    },
                ));
            }
        }
        best.map(|(_, resolved)| resolved)
    }

    pub fn get(&self, kind: EndpointKind) -> Option<&EndpointDescriptor> {
        self.endpoints
            .iter()
            .map(|(d, _)| d)
            .find(|d| d.kind == kind)
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &EndpointDescriptor> {
        self.endpoints.iter().map(|(d, _)| d)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Catalog;

    fn table() -> EndpointTable {
        EndpointTable::new(Catalog::builtin().endpoints).unwrap()
    }

    #[test]
    fn test_resolve_with_params() {
        let t = table();
        let r = t.resolve(HttpMethod::Get, "/api/v1/pricing/mensal").unwrap();
        assert_eq!(r.descriptor.kind, EndpointKind::PriceQuote);
        assert_eq!(r.path_params["plan"], "mensal");

        let r = t.resolve(HttpMethod::Get, "/api/v1/regions/br/").unwrap();
        assert_eq!(r.descriptor.kind, EndpointKind::RegionLookup);
        assert_eq!(r.path_params["country"], "br");
    }

    #[test]
    fn test_method_distinguishes_endpoints() {
        let t = table();
        assert_eq!(
            t.resolve(HttpMethod::Get, "/api/v1/tax").unwrap().descriptor.kind,
            EndpointKind::TaxEstimate
        );
        assert!(t.resolve(HttpMethod::Post, "/api/v1/tax").is_none());
        assert!(t.resolve(HttpMethod::Delete, "/api/v1/usage").is_none());
    }

    #[test]
    fn test_unmapped_paths() {
        let t = table();
        assert!(t.resolve(HttpMethod::Get, "/api/v1/unknown").is_none());
        assert!(t.resolve(HttpMethod::Get, "/api/v1/pricing").is_none());
        assert!(t.resolve(HttpMethod::Get, "/api/v1/pricing/a/b").is_none());
    }

    #[test]
    fn test_literal_beats_placeholder() {
        let mut descriptors = Catalog::builtin().endpoints;
        let mut literal = descriptors
            .iter()
            .find(|d| d.kind == EndpointKind::PriceQuote)
            .unwrap()
            .clone();
        literal.kind = EndpointKind::UsageReport;
        literal.pattern = "/api/v1/pricing/current".into();
        descriptors.retain(|d| d.kind != EndpointKind::UsageReport);
        descriptors.push(literal);

        let t = EndpointTable::new(descriptors).unwrap();
        assert_eq!(
            t.resolve(HttpMethod::Get, "/api/v1/pricing/current").unwrap().descriptor.kind,
            EndpointKind::UsageReport
        );
    }

    #[test]
    fn test_invalid_tables_rejected() {
        let mut descriptors = Catalog::builtin().endpoints;
        descriptors.push(descriptors[0].clone());
        assert!(EndpointTable::new(descriptors).is_err());

        let mut descriptors = Catalog::builtin().endpoints;
        descriptors[0].rate_limit.limit = 0;
        assert!(EndpointTable::new(descriptors).is_err());

        let mut descriptors = Catalog::builtin().endpoints;
        descriptors[0].pattern = "api/v1/{}".into();
        assert!(EndpointTable::new(descriptors).is_err());

        let mut descriptors = Catalog::builtin().endpoints;
        descriptors[0].cost = Decimal::new(-1, 3);
        assert!(EndpointTable::new(descriptors).is_err());

        let mut descriptors = Catalog::builtin().endpoints;
        descriptors[0].cost = Decimal::new(1, 7);
        assert!(EndpointTable::new(descriptors).is_err());
    }
}
