/*
 * Adapted from Stalwart Mail Server, which is available on
 * https://github.com/stalwartlabs/mail-server/
 *
 * and carries the following license notice:
 *
 * Copyright (c) 2023 Stalwart Labs Ltd.
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as
 * published by the Free Software Foundation, either version 3 of
 * the License, or (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 * in the LICENSE file at the top-level directory of this distribution.
 * You should have received a copy of the GNU Affero General Public License
 * along with this program.  If not, see <http://www.gnu.org/licenses/>.
 *
 * You can be released from the requirements of the AGPLv3 license by
 * purchasing a commercial license. Please contact licensing@stalw.art
 * for more details.
*/

pub mod command;
pub mod fsm;
pub mod server;
pub mod session;

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Configuration {
    pub hostname: String,
    pub greeting: String,

    pub max_message_size: usize,
    pub max_recipients: usize,
    pub require_auth: bool,
    pub max_auth_attempts: usize,

    pub connection_timeout: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
}

impl Default for Configuration {
    fn default() -> Self {
        Configuration {
            hostname: "localhost".to_string(),
            greeting: "Loam SMTP Server".to_string(),
            max_message_size: 10 * 1024 * 1024,
            max_recipients: 100,
            require_auth: true,
            max_auth_attempts: 3,
            connection_timeout: Duration::from_secs(300),
            read_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(60),
        }
    }
}

/// A single SMTP response: three-digit status code plus one or more text
/// lines. All lines but the last are sent with the hyphen continuation
/// marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: u16,
    pub lines: Vec<String>,
}

impl Reply {
    pub fn new(code: u16, text: impl Into<String>) -> Self {
        Reply {
            code,
            lines: vec![text.into()],
        }
    }

    pub fn multiline(code: u16, lines: Vec<String>) -> Self {
        debug_assert!(!lines.is_empty());
        Reply { code, lines }
    }

    pub fn is_positive(&self) -> bool {
        self.code < 400
    }

    /// Render with CRLF framing, `250-...` continuations and a final
    /// `250 ...` line.
    pub fn to_wire(&self) -> String {
        let mut out = String::with_capacity(self.lines.len() * 32);
        for (index, line) in self.lines.iter().enumerate() {
            let separator = if index + 1 == self.lines.len() { ' ' } else { '-' };
            out.push_str(&format!("{}{}{}\r\n", self.code, separator, line));
        }
        out
    }
}

/// Validate a mailbox address against the dot-atom rules of RFC 5321:
/// exactly one `@`, a 1-64 octet local part and a 1-255 octet domain,
/// neither with empty, leading or trailing dot labels, 254 octets overall.
pub fn is_valid_address(address: &str) -> bool {
    if address.is_empty() || address.len() > 254 {
        return false;
    }

    let mut parts = address.split('@');
    let (local, domain) = match (parts.next(), parts.next(), parts.next()) {
        (Some(local), Some(domain), None) => (local, domain),
        _ => return false,
    };

    if local.is_empty() || local.len() > 64 || domain.is_empty() || domain.len() > 255 {
        return false;
    }

    let local_ok = local.split('.').all(|atom| {
        !atom.is_empty()
            && atom.bytes().all(|b| {
                b.is_ascii_alphanumeric()
                    || matches!(
                        b,
                        b'!' | b'#'
                            | b'$'
                            | b'%'
                            | b'&'
                            | b'\''
                            | b'*'
                            | b'+'
                            | b'-'
                            | b'/'
                            | b'='
                            | b'?'
                            | b'^'
                            | b'_'
                            | b'`'
                            | b'{'
                            | b'|'
                            | b'}'
                            | b'~'
                    )
            })
    });

    let domain_ok = domain.split('.').all(|label| {
        !label.is_empty()
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-')
    });

    local_ok && domain_ok
}

/// Canonical form for storage: the domain is lowercased, the local part is
/// preserved as sent.
pub fn canonical_address(address: &str) -> String {
    match address.rsplit_once('@') {
        Some((local, domain)) => format!("{}@{}", local, domain.to_lowercase()),
        None => address.to_string(),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn reply_rendering() {
        assert_eq!(Reply::new(250, "Ok").to_wire(), "250 Ok\r\n");
        assert_eq!(
            Reply::multiline(
                250,
                vec!["mail.test Hello".to_string(), "SMTPUTF8".to_string()]
            )
            .to_wire(),
            "250-mail.test Hello\r\n250 SMTPUTF8\r\n"
        );
    }

    #[test]
    fn address_validation_accepts_dot_atoms() {
        for address in [
            "a@x.test",
            "first.last@example.com",
            "user+tag@sub.domain.example",
            "o'brien@example.ie",
            "x@y",
        ] {
            assert!(is_valid_address(address), "{address} should be valid");
        }
    }

    #[test]
    fn address_validation_rejects_malformed() {
        let long_local = format!("{}@x.test", "a".repeat(65));
        let long_total = format!("{}@{}.test", "a".repeat(64), "b".repeat(200));
        for address in [
            "",
            "plain",
            "two@@x.test",
            "a@b@c",
            "@x.test",
            "a@",
            ".lead@x.test",
            "trail.@x.test",
            "dou..ble@x.test",
            "a@.x.test",
            "a@x..test",
            "a@x.test.",
            "a@-x.test",
            "a@x-.test",
            "sp ace@x.test",
            "a@x_y.test",
            long_local.as_str(),
            long_total.as_str(),
        ] {
            assert!(!is_valid_address(address), "{address} should be invalid");
        }
    }

    #[test]
    fn canonical_address_lowercases_domain_only() {
        assert_eq!(canonical_address("MiXeD@EXAMPLE.Com"), "MiXeD@example.com");
    }
}
