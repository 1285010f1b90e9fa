// Validation shared by the mutation handlers: domain names as routing keys
// and CIDR blocks for ingress allow/deny lists.

const MAX_DOMAIN_LEN: usize = 253;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DomainError {
    #[error("empty domain")]
    Empty,
    #[error("root domain '.' is not allowed")]
    Root,
    #[error("'*.' must be followed by a domain")]
    BareWildcard,
    #[error("invalid IDN: {0}")]
    Idn(String),
    #[error("domain exceeds {MAX_DOMAIN_LEN} characters")]
    TooLong,
    #[error("labels must be separated by a single dot")]
    DotLayout,
    #[error("empty label")]
    EmptyLabel,
    #[error("underscores are not allowed in labels")]
    Underscore,
    #[error("invalid label: {0}")]
    Label(String),
}

/// Checks whether a string is a usable routing domain.
///
/// Accepts `*` and `*.<domain>` (wildcard only as the entire leftmost
/// label), tolerates a single trailing dot, and IDN-normalizes everything
/// else with strict lookup semantics before checking label grammar.
pub fn validate_domain(input: &str) -> Result<(), DomainError> {
    let mut s = input.trim();
    if s.is_empty() {
        return Err(DomainError::Empty);
    }
    if s == "." {
        return Err(DomainError::Root);
    }
    if let Some(stripped) = s.strip_suffix('.') {
        s = stripped;
    }

    if s == "*" {
        return Ok(());
    }
    if let Some(rest) = s.strip_prefix("*.") {
        if rest.is_empty() {
            return Err(DomainError::BareWildcard);
        }
        return validate_hostname(rest);
    }
    validate_hostname(s)
}

fn validate_hostname(s: &str) -> Result<(), DomainError> {
    let ascii =
        idna::domain_to_ascii_strict(s).map_err(|err| DomainError::Idn(err.to_string()))?;
    if ascii.len() > MAX_DOMAIN_LEN {
        return Err(DomainError::TooLong);
    }
    if ascii.contains("..") || ascii.starts_with('.') || ascii.ends_with('.') {
        return Err(DomainError::DotLayout);
    }
    for label in ascii.split('.') {
        if label.is_empty() {
            return Err(DomainError::EmptyLabel);
        }
        if label.contains('_') {
            return Err(DomainError::Underscore);
        }
        if !valid_label(label) {
            return Err(DomainError::Label(label.to_string()));
        }
    }
    Ok(())
}

// Label grammar after IDN normalization: lowercase alphanumeric with
// interior hyphens, 1-63 bytes.
fn valid_label(label: &str) -> bool {
    let bytes = label.as_bytes();
    if bytes.is_empty() || bytes.len() > 63 {
        return false;
    }
    let alnum = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    if !alnum(bytes[0]) || !alnum(bytes[bytes.len() - 1]) {
        return false;
    }
    bytes.iter().all(|&b| alnum(b) || b == b'-')
}

/// A CIDR block is valid when it parses as an IP network, v4 or v6.
pub fn is_valid_cidr(s: &str) -> bool {
    s.parse::<ipnet::IpNet>().is_ok()
}
