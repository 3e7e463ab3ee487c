//! The predicate a probed device is checked against before it is allowed to
//! join an assembly: [`ArrayIdentity`].

/// Describes which array we are looking for. Any field left unset matches
/// anything — an identity with every field unset matches every superblock.
#[derive(Clone, Debug, Default)]
pub struct ArrayIdentity {
    pub uuid: Option<u128>,
    pub super_minor: Option<u32>,
    pub level: Option<i32>,
    pub raid_disks: Option<u32>,
    /// Whitelist of device name patterns; `None` means "don't restrict by
    /// name". Patterns are matched with [`match_oneof`].
    pub devices: Option<Vec<String>>,
}

impl ArrayIdentity {
    pub fn is_empty(&self) -> bool
    {
        self.uuid.is_none()
            && self.super_minor.is_none()
            && self.level.is_none()
            && self.raid_disks.is_none()
            && self.devices.is_none()
    }
}

/// Parse a UUID as 32 hex digits, optionally separated by `-` or `:`, the
/// form both `--uuid` and a config file's `uuid=` field accept.
pub fn parse_uuid(raw: &str) -> anyhow::Result<u128>
{
    let clean: String = raw.chars().filter(|c| *c != '-' && *c != ':').collect();
    u128::from_str_radix(&clean, 16).map_err(|_| anyhow::anyhow!("invalid uuid {raw:?}"))
}

/// True if `path` matches any of `patterns`. A pattern matches either by
/// exact string equality or by a single trailing `*` glob, which is all the
/// original tool's device-list whitelisting ever needed.
pub fn match_oneof(patterns: &[String], path: &str) -> bool
{
    patterns.iter().any(|pat| match pat.strip_suffix('*') {
        Some(prefix) => path.starts_with(prefix),
        None => pat == path,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_identity_has_no_identifying_fields()
    {
        let ident = ArrayIdentity::default();
        assert!(ident.is_empty());
    }

    #[test]
    fn identity_with_uuid_is_not_empty()
    {
        let ident = ArrayIdentity { uuid: Some(1), ..Default::default() };
        assert!(!ident.is_empty());
    }

    #[test]
    fn identity_with_level_is_not_empty()
    {
        let ident = ArrayIdentity { level: Some(5), ..Default::default() };
        assert!(!ident.is_empty());
    }

    #[test]
    fn identity_with_raid_disks_is_not_empty()
    {
        let ident = ArrayIdentity { raid_disks: Some(3), ..Default::default() };
        assert!(!ident.is_empty());
    }

    #[test]
    fn parse_uuid_strips_separators()
    {
        assert_eq!(
            parse_uuid("12345678:9abcdef0:00000000:00000000").unwrap(),
            parse_uuid("123456789abcdef0000000000000000").unwrap()
        );
    }

    #[test]
    fn parse_uuid_rejects_garbage()
    {
        assert!(parse_uuid("not-hex-at-all-zz").is_err());
    }

    #[test]
    fn match_oneof_exact()
    {
        let patterns = vec!["/dev/sda1".to_string()];
        assert!(match_oneof(&patterns, "/dev/sda1"));
        assert!(!match_oneof(&patterns, "/dev/sda2"));
    }

    #[test]
    fn match_oneof_glob_prefix()
    {
        let patterns = vec!["/dev/sd*".to_string()];
        assert!(match_oneof(&patterns, "/dev/sda1"));
        assert!(match_oneof(&patterns, "/dev/sdb"));
        assert!(!match_oneof(&patterns, "/dev/nvme0n1"));
    }
}
