use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use minijinja::{Environment, UndefinedBehavior};

use crate::date_util::ProtocolTimestamp;
use crate::error::Result;

const TEMPLATES: &[(&str, &str)] = &[
    ("login.xml", include_str!("templates/login.xml")),
    ("logout.xml", include_str!("templates/logout.xml")),
    (
        "getMCTransExtLocV2.xml",
        include_str!("templates/getMCTransExtLocV2.xml"),
    ),
];

/// A remote operation that can be rendered into a SOAP envelope.
pub trait ProtocolRequest {
    /// Sent as the `SOAPAction` header.
    fn operation_name(&self) -> &'static str;
    fn template_name(&self) -> &'static str;
    /// Template variables, excluding the session token.
    fn context(&self) -> BTreeMap<&'static str, String>;
}

pub struct LoginRequest<'a> {
    pub username: &'a str,
    pub password: &'a str,
}

impl ProtocolRequest for LoginRequest<'_> {
    fn operation_name(&self) -> &'static str {
        "login"
    }

    fn template_name(&self) -> &'static str {
        "login.xml"
    }

    fn context(&self) -> BTreeMap<&'static str, String> {
        BTreeMap::from([
            ("user", self.username.to_string()),
            ("password", self.password.to_string()),
        ])
    }
}

pub struct LogoutRequest;

impl ProtocolRequest for LogoutRequest {
    fn operation_name(&self) -> &'static str {
        "logout"
    }

    fn template_name(&self) -> &'static str {
        "logout.xml"
    }

    fn context(&self) -> BTreeMap<&'static str, String> {
        BTreeMap::new()
    }
}

/// `getMCTransExtLocV2`: transactions with extended location data in a date range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionsRequest {
    pub begin: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl ProtocolRequest for TransactionsRequest {
    fn operation_name(&self) -> &'static str {
        "getMCTransExtLocV2"
    }

    fn template_name(&self) -> &'static str {
        "getMCTransExtLocV2.xml"
    }

    fn context(&self) -> BTreeMap<&'static str, String> {
        BTreeMap::from([
            ("begDate", self.begin.to_protocol_timestamp()),
            ("endDate", self.end.to_protocol_timestamp()),
        ])
    }
}

/// Renders request envelopes from the templates compiled into the binary.
/// Values are XML-escaped on output.
pub struct EnvelopeRenderer {
    env: Environment<'static>,
}

impl EnvelopeRenderer {
    pub fn new() -> Result<Self> {
        let mut env = Environment::new();
        env.set_trim_blocks(true);
        env.set_lstrip_blocks(true);
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        for &(name, source) in TEMPLATES {
            env.add_template(name, source)?;
        }
        Ok(Self { env })
    }

    pub fn render<R: ProtocolRequest + ?Sized>(
        &self,
        request: &R,
        client_id: Option<&str>,
    ) -> Result<String> {
        let mut context = request.context();
        if let Some(id) = client_id {
            context.insert("client_id", id.to_string());
        }
        let template = self.env.get_template(request.template_name())?;
        Ok(template.render(&context)?)
    }
}
