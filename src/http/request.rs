/// The routing-relevant part of a client request: request line plus the
/// headers seen before the parser reported it ready.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestHead {
    /// Request method (e.g. "GET", "CONNECT"). Never empty.
    pub method: String,
    /// Request target as sent: origin-form, absolute-form or authority-form.
    pub target: String,
    /// Protocol version (typically "HTTP/1.1")
    pub version: String,
    /// Headers in arrival order, names as sent.
    pub headers: Vec<(String, String)>,
}

impl RequestHead {
    /// Looks up a header value by name, ignoring ASCII case.
    ///
    /// # Example
    ///
    /// ```
    /// # use conduit::http::request::RequestHead;
    /// let head = RequestHead {
    ///     method: "GET".into(),
    ///     target: "/".into(),
    ///     version: "HTTP/1.1".into(),
    ///     headers: vec![("Host".into(), "example.com".into())],
    /// };
    /// assert_eq!(head.header("host"), Some("example.com"));
    /// assert_eq!(head.header("Accept"), None);
    /// ```
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// True when the target carries its own authority, so no `Host` header
    /// is needed to route it.
    pub fn target_has_authority(&self) -> bool {
        target_has_authority(&self.target)
    }

    pub fn target_form(&self) -> TargetForm {
        TargetForm::of(&self.target)
    }
}

/// Request-target forms that matter for routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetForm {
    /// `scheme://authority[/path]`
    Absolute,
    /// `host:port`, as sent with CONNECT.
    Authority,
    /// `/path[?query]`, `*`, or anything else that needs a `Host` header.
    Origin,
}

impl TargetForm {
    /// Classifies `target` by its prefix only; the query of an origin-form
    /// target may contain anything.
    pub fn of(target: &str) -> Self {
        if has_scheme_prefix(target) {
            TargetForm::Absolute
        } else if is_authority(target) {
            TargetForm::Authority
        } else {
            TargetForm::Origin
        }
    }
}

/// Absolute-form and authority-form targets name their destination
/// directly; origin-form (`/path`) and `*` do not.
pub fn target_has_authority(target: &str) -> bool {
    TargetForm::of(target) != TargetForm::Origin
}

/// `ALPHA *( ALPHA / DIGIT / "+" / "-" / "." ) "://"`
fn has_scheme_prefix(target: &str) -> bool {
    let Some((scheme, _)) = target.split_once("://") else {
        return false;
    };
    let mut chars = scheme.chars();
    chars.next().is_some_and(|c| c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
}

/// `host:port` with a numeric port and no path.
fn is_authority(target: &str) -> bool {
    if target.contains('/') {
        return false;
    }
    match target.rsplit_once(':') {
        Some((host, port)) => {
            !host.is_empty() && !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit())
        }
        None => false,
    }
}
