//! Domain keys
//!
//! A domain key names both a pub/sub topic and a durable log key:
//!
//! ```text
//! aps[<app>].ns[<namespace>].ds[<source>].dts[<device>]
//! aps[<app>].ns[<namespace>].bcasts[<channel>].fog
//! aps[<app>].ns[<namespace>.cbor].bcasts[<channel>]
//! ```
//!
//! Components may not contain brackets, which is what makes `parse` the exact
//! inverse of `build`. The `.cbor` namespace suffix is reserved for the compact
//! broadcast domain and is rejected in user namespaces.

use crate::error::DataError;
use crate::hierarchy::Level;
use std::fmt;

const COMPACT_SUFFIX: &str = ".cbor";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    DataSource,
    Broadcast,
    Flow,
}

impl EntityKind {
    fn tag(self) -> &'static str {
        match self {
            EntityKind::DataSource => "ds",
            EntityKind::Broadcast => "bcasts",
            EntityKind::Flow => "flow",
        }
    }

    fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "ds" => Some(EntityKind::DataSource),
            "bcasts" => Some(EntityKind::Broadcast),
            "flow" => Some(EntityKind::Flow),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DomainKey {
    pub app: String,
    pub namespace: String,
    /// Compact (CBOR) variant of a broadcast domain
    pub compact: bool,
    pub kind: EntityKind,
    pub name: String,
    pub device: Option<String>,
    pub level: Option<Level>,
}

impl DomainKey {
    pub fn data_stream(app: &str, namespace: &str, source: &str, device: &str) -> Self {
        DomainKey {
            app: app.to_string(),
            namespace: namespace.to_string(),
            compact: false,
            kind: EntityKind::DataSource,
            name: source.to_string(),
            device: Some(device.to_string()),
            level: None,
        }
    }

    pub fn data_source(app: &str, namespace: &str, source: &str) -> Self {
        DomainKey {
            device: None,
            ..Self::data_stream(app, namespace, source, "")
        }
    }

    pub fn broadcast(app: &str, namespace: &str, channel: &str) -> Self {
        DomainKey {
            app: app.to_string(),
            namespace: namespace.to_string(),
            compact: false,
            kind: EntityKind::Broadcast,
            name: channel.to_string(),
            device: None,
            level: None,
        }
    }

    pub fn with_level(mut self, level: Option<Level>) -> Self {
        self.level = level;
        self
    }

    pub fn into_compact(mut self) -> Self {
        self.compact = true;
        self
    }

    /// Key with the device component stripped (the owning data source)
    pub fn source_key(&self) -> DomainKey {
        DomainKey {
            device: None,
            level: None,
            ..self.clone()
        }
    }

    pub fn validate(&self) -> Result<(), DataError> {
        check_component("app", &self.app)?;
        check_component("namespace", &self.namespace)?;
        if self.namespace.ends_with(COMPACT_SUFFIX) {
            return Err(DataError::InvalidDomainKey(format!(
                "namespace may not end with {}: {}",
                COMPACT_SUFFIX, self.namespace
            )));
        }
        check_component("name", &self.name)?;
        if let Some(device) = &self.device {
            check_component("device", device)?;
        }
        Ok(())
    }

    pub fn build(&self) -> Result<String, DataError> {
        self.validate()?;
        Ok(self.to_string())
    }

    pub fn parse(key: &str) -> Result<DomainKey, DataError> {
        let invalid = |why: &str| DataError::InvalidDomainKey(format!("{}: {}", why, key));

        let mut segments: Vec<(&str, &str)> = Vec::with_capacity(4);
        let mut level = None;
        let mut rest = key;

        loop {
            let open = rest.find('[').ok_or_else(|| invalid("missing '['"))?;
            let close = rest[open + 1..]
                .find(']')
                .map(|i| open + 1 + i)
                .ok_or_else(|| invalid("missing ']'"))?;
            let tag = &rest[..open];
            let content = &rest[open + 1..close];
            if tag.contains('.') || content.contains('[') {
                return Err(invalid("malformed segment"));
            }
            segments.push((tag, content));

            rest = &rest[close + 1..];
            if rest.is_empty() {
                break;
            }
            rest = rest.strip_prefix('.').ok_or_else(|| invalid("expected '.'"))?;
            if !rest.contains('[') {
                level = Some(rest.parse::<Level>().map_err(|e| invalid(e.as_str()))?);
                break;
            }
        }

        let (app, ns, (kind_tag, name), device) = match segments.as_slice() {
            [("aps", app), ("ns", ns), entity] => (*app, *ns, *entity, None),
            [("aps", app), ("ns", ns), entity, ("dts", dev)] => (*app, *ns, *entity, Some(*dev)),
            _ => return Err(invalid("unexpected segment layout")),
        };
        let kind = EntityKind::from_tag(kind_tag).ok_or_else(|| invalid("unknown entity kind"))?;

        let (namespace, compact) = match ns.strip_suffix(COMPACT_SUFFIX) {
            Some(base) => (base, true),
            None => (ns, false),
        };

        let parsed = DomainKey {
            app: app.to_string(),
            namespace: namespace.to_string(),
            compact,
            kind,
            name: name.to_string(),
            device: device.map(str::to_string),
            level,
        };
        parsed.validate()?;
        Ok(parsed)
    }

    /// Glob matching every stream key of a data source (KEYS syntax)
    pub fn stream_pattern(&self) -> String {
        format!(
            "aps\\[{}\\].ns\\[{}\\].{}\\[{}\\].dts\\[*\\]",
            self.app,
            self.namespace,
            self.kind.tag(),
            self.name
        )
    }
}

impl fmt::Display for DomainKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "aps[{}].ns[{}", self.app, self.namespace)?;
        if self.compact {
            f.write_str(COMPACT_SUFFIX)?;
        }
        write!(f, "].{}[{}]", self.kind.tag(), self.name)?;
        if let Some(device) = &self.device {
            write!(f, ".dts[{}]", device)?;
        }
        if let Some(level) = self.level {
            write!(f, ".{}", level.code())?;
        }
        Ok(())
    }
}

fn check_component(what: &str, value: &str) -> Result<(), DataError> {
    if value.is_empty() {
        return Err(DataError::InvalidDomainKey(format!("empty {}", what)));
    }
    if value.contains('[') || value.contains(']') {
        return Err(DataError::InvalidDomainKey(format!(
            "{} may not contain brackets: {}",
            what, value
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_key_format() {
        let key = DomainKey::data_stream("app1", "global", "temp", "dev7_device");
        assert_eq!(key.build().unwrap(), "aps[app1].ns[global].ds[temp].dts[dev7_device]");
    }

    #[test]
    fn test_broadcast_domains() {
        let base = DomainKey::broadcast("app1", "global", "news");
        assert_eq!(base.to_string(), "aps[app1].ns[global].bcasts[news]");
        assert_eq!(
            base.clone().with_level(Some(Level::Fog)).to_string(),
            "aps[app1].ns[global].bcasts[news].fog"
        );
        assert_eq!(
            base.into_compact().with_level(Some(Level::Fog)).to_string(),
            "aps[app1].ns[global.cbor].bcasts[news].fog"
        );
    }

    #[test]
    fn test_parse_inverts_build() {
        let cases = vec![
            DomainKey::data_stream("a", "global", "temp", "d1_device"),
            DomainKey::data_stream("my.app", "ns.with.dots", "x", "y.z"),
            DomainKey::data_source("a", "n", "src"),
            DomainKey::broadcast("a", "global", "chan"),
            DomainKey::broadcast("a", "global", "chan").with_level(Some(Level::Cloud)),
            DomainKey::broadcast("a", "global", "chan")
                .into_compact()
                .with_level(Some(Level::Fog)),
            DomainKey {
                kind: EntityKind::Flow,
                ..DomainKey::data_source("a", "n", "f")
            },
        ];
        for key in cases {
            let built = key.build().unwrap();
            assert_eq!(DomainKey::parse(&built).unwrap(), key, "round trip of {}", built);
        }
    }

    #[test]
    fn test_distinct_entities_do_not_collide() {
        let a = DomainKey::data_stream("a", "n", "s", "d").build().unwrap();
        let b = DomainKey::data_stream("a", "n.s", "d", "x").build().unwrap();
        let c = DomainKey::broadcast("a", "n", "s").build().unwrap();
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_rejects_invalid_components() {
        assert!(DomainKey::data_stream("a", "n", "s[1]", "d").build().is_err());
        assert!(DomainKey::data_stream("", "n", "s", "d").build().is_err());
        assert!(DomainKey::broadcast("a", "x.cbor", "c").build().is_err());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(DomainKey::parse("__keyevent@0__:xadd").is_err());
        assert!(DomainKey::parse("aps[a].ns[b]").is_err());
        assert!(DomainKey::parse("aps[a].ns[b].ds[c].edge").is_err());
        assert!(DomainKey::parse("aps[a].ns[b].zz[c]").is_err());
    }

    #[test]
    fn test_source_key_strips_device() {
        let key = DomainKey::parse("aps[a].ns[global].ds[temp].dts[d1]").unwrap();
        assert_eq!(key.source_key().to_string(), "aps[a].ns[global].ds[temp]");
        assert_eq!(key.stream_pattern(), "aps\\[a\\].ns\\[global\\].ds\\[temp\\].dts\\[*\\]");
    }
}
