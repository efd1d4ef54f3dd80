/*
 * Loam Mail Server
 *
 * Copyright (c) 2023 Tibor Djurica Potpara
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
*/

/// Outcome of credential verification, posted back to the state machine
/// from the worker pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    Accepted,
    Rejected,
    /// The check itself could not be performed (pool or query failure).
    Unavailable,
}

/// Outcome of the final message commit, posted back to the state machine
/// from the worker pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    Stored(u64),
    /// No connection could be leased; the client may retry.
    Unavailable,
    /// The transaction failed and was rolled back.
    Failed,
}

/// Everything the session can feed into the state machine: one variant per
/// wire command, the DATA payload events, and the internal completion
/// events for deferred work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Connected,
    Ehlo(String),
    Auth(String),
    MailFrom(String),
    RcptTo(String),
    Data(String),
    DataLine(Vec<u8>),
    DataEnd,
    Rset,
    Noop,
    Quit,
    StartTls,
    Vrfy,
    Unknown(String),
    Timeout,
    /// Posted by the session for faults below the command layer, e.g. a
    /// line that never terminates within the framing buffer.
    Error(String),

    AuthDone(AuthOutcome),
    CommitDone(CommitOutcome),
}

impl Event {
    /// Map a command line onto an event: the first word, uppercased,
    /// selects the kind and the remainder becomes the argument. Lines in
    /// DATA or AUTH continuation states never pass through here.
    pub fn parse_command(line: &[u8]) -> Event {
        let line = String::from_utf8_lossy(line);
        let trimmed = line.trim();
        let (verb, args) = match trimmed.split_once(char::is_whitespace) {
            Some((verb, args)) => (verb, args.trim()),
            None => (trimmed, ""),
        };

        match verb.to_ascii_uppercase().as_str() {
            "EHLO" | "HELO" => Event::Ehlo(args.to_string()),
            "AUTH" => Event::Auth(args.to_string()),
            "MAIL" => Event::MailFrom(args.to_string()),
            "RCPT" => Event::RcptTo(args.to_string()),
            "DATA" => Event::Data(args.to_string()),
            "RSET" => Event::Rset,
            "NOOP" => Event::Noop,
            "VRFY" => Event::Vrfy,
            "STARTTLS" => Event::StartTls,
            "QUIT" => Event::Quit,
            _ => Event::Unknown(verb.to_string()),
        }
    }

    /// Map a line received while in DATA: the bare dot terminates the
    /// payload, everything else is a payload line.
    pub fn parse_data_line(line: &[u8]) -> Event {
        if line == b"." {
            Event::DataEnd
        } else {
            Event::DataLine(line.to_vec())
        }
    }
}

/// Extract the mailbox from a `FROM:<...>` / `TO:<...>` argument. The
/// keyword is matched case-insensitively, whitespace around the colon and
/// brackets is tolerated, and trailing ESMTP parameters are ignored.
pub fn parse_path_argument<'a>(args: &'a str, keyword: &str) -> Option<&'a str> {
    let rest = args.trim_start();
    if !rest.get(..keyword.len())?.eq_ignore_ascii_case(keyword) {
        return None;
    }
    let rest = rest[keyword.len()..].trim_start();
    let rest = rest.strip_prefix(':')?.trim_start();

    let rest = rest.strip_prefix('<')?;
    let end = rest.find('>')?;
    Some(&rest[..end])
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn verbs_are_case_insensitive() {
        assert_eq!(
            Event::parse_command(b"ehlo client.example"),
            Event::Ehlo("client.example".to_string())
        );
        assert_eq!(
            Event::parse_command(b"Helo client"),
            Event::Ehlo("client".to_string())
        );
        assert_eq!(
            Event::parse_command(b"mail FROM:<a@x.test>"),
            Event::MailFrom("FROM:<a@x.test>".to_string())
        );
        assert_eq!(Event::parse_command(b"QUIT"), Event::Quit);
        assert_eq!(Event::parse_command(b"starttls"), Event::StartTls);
    }

    #[test]
    fn unknown_keeps_the_verb() {
        assert_eq!(
            Event::parse_command(b"XYZZY something"),
            Event::Unknown("XYZZY".to_string())
        );
    }

    #[test]
    fn data_lines_and_terminator() {
        assert_eq!(
            Event::parse_data_line(b"..stuffed"),
            Event::DataLine(b"..stuffed".to_vec())
        );
        assert_eq!(Event::parse_data_line(b"."), Event::DataEnd);
    }

    #[test]
    fn path_argument_parsing() {
        assert_eq!(
            parse_path_argument("FROM:<a@x.test>", "FROM"),
            Some("a@x.test")
        );
        assert_eq!(
            parse_path_argument("from: <a@x.test>", "FROM"),
            Some("a@x.test")
        );
        assert_eq!(
            parse_path_argument("TO:<b@y.test> NOTIFY=NEVER", "TO"),
            Some("b@y.test")
        );
        assert_eq!(parse_path_argument("FROM:<>", "FROM"), Some(""));
        assert_eq!(parse_path_argument("FROM:a@x.test", "FROM"), None);
        assert_eq!(parse_path_argument("TO:<b@y.test>", "FROM"), None);
        assert_eq!(parse_path_argument("<a@x.test>", "FROM"), None);
    }
}
