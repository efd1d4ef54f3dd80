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

use std::sync::Arc;

use base64::{engine::general_purpose, Engine as _};

use crate::{
    smtp::{
        canonical_address,
        command::{parse_path_argument, AuthOutcome, CommitOutcome, Event},
        is_valid_address, Configuration, Reply,
    },
    store::ReceivedMessage,
};

/// Consecutive protocol violations tolerated before the session is dropped.
const MAX_ERROR_STRIKES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Connection accepted, greeting not yet generated.
    Init,
    /// Greeting generated; the session promotes to `AwaitingEhlo` once the
    /// greeting write completes.
    Greeted,
    AwaitingEhlo,
    AwaitingAuth,
    AwaitingAuthUser,
    AwaitingAuthPass,
    /// Credential check running on the worker pool.
    VerifyingCredentials,
    AwaitingMailFrom,
    /// MAIL accepted, no recipients yet.
    AwaitingRcptTo,
    /// At least one recipient accepted; DATA is admissible.
    AwaitingData,
    InData,
    /// Message commit running on the worker pool.
    Committing,
    /// Farewell written; connection teardown pending.
    AwaitingQuit,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMechanism {
    Login,
    Plain,
}

/// Mutable per-connection state. The state machine itself is stateless
/// shared logic; everything it changes lives here.
#[derive(Debug)]
pub struct SessionContext {
    pub state: SessionState,
    pub peer_hello: String,

    pub auth_mechanism: Option<AuthMechanism>,
    pub auth_username: String,
    pub auth_secret: String,
    pub is_authenticated: bool,
    pub auth_failures: usize,

    pub sender: String,
    pub recipients: Vec<String>,
    pub message: Vec<u8>,

    pub error_strikes: u32,
}

impl SessionContext {
    pub fn new() -> Self {
        SessionContext {
            state: SessionState::Init,
            peer_hello: String::new(),
            auth_mechanism: None,
            auth_username: String::new(),
            auth_secret: String::new(),
            is_authenticated: false,
            auth_failures: 0,
            sender: String::new(),
            recipients: Vec::new(),
            message: Vec::new(),
            error_strikes: 0,
        }
    }

    /// Called by the session once the greeting write has completed.
    pub fn greeting_sent(&mut self) {
        if self.state == SessionState::Greeted {
            self.state = SessionState::AwaitingEhlo;
        }
    }

    /// Called by the session after flush and TLS shutdown.
    pub fn closed(&mut self) {
        self.state = SessionState::Closed;
    }

    fn clear_transaction(&mut self) {
        self.sender.clear();
        self.recipients.clear();
        self.message = Vec::new();
    }

    fn clear_auth_exchange(&mut self) {
        self.auth_mechanism = None;
        self.auth_username.clear();
        self.auth_secret.clear();
    }
}

impl Default for SessionContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Blocking work the session must run on the worker executor before the
/// next event is admitted.
#[derive(Debug, PartialEq, Eq)]
pub enum DeferredOp {
    VerifyCredentials { username: String, secret: String },
    Commit(ReceivedMessage),
}

/// What the session should do with the outcome of a dispatch.
#[derive(Debug, PartialEq, Eq)]
pub enum Action {
    /// Write the reply and keep reading.
    Reply(Reply),
    /// Nothing to write (DATA payload lines).
    Silent,
    /// Run the operation on the worker pool, then dispatch its outcome
    /// event. No reply is written until the outcome arrives.
    Defer(DeferredOp),
    /// Write the reply, then tear the connection down.
    Hangup(Reply),
}

/// The per-connection SMTP protocol automaton. One instance is shared by
/// all sessions; `dispatch` mutates only the passed context, so the output
/// is a pure function of `(state, event, context)`.
pub struct StateMachine {
    config: Arc<Configuration>,
}

impl StateMachine {
    pub fn new(config: Arc<Configuration>) -> Self {
        Self { config }
    }

    pub fn dispatch(&self, ctx: &mut SessionContext, event: Event) -> Action {
        let action = self.transition(ctx, event);
        match &action {
            // A completed command clears the strike counter.
            Action::Reply(reply) if reply.is_positive() => ctx.error_strikes = 0,
            Action::Hangup(_) => ctx.state = SessionState::AwaitingQuit,
            _ => {}
        }
        action
    }

    fn transition(&self, ctx: &mut SessionContext, event: Event) -> Action {
        use SessionState::*;

        match ctx.state {
            AwaitingQuit | Closed => return Action::Silent,
            VerifyingCredentials => {
                return match event {
                    Event::AuthDone(outcome) => self.auth_done(ctx, outcome),
                    _ => Action::Reply(Reply::new(421, "Service unavailable, try again later")),
                }
            }
            Committing => {
                return match event {
                    Event::CommitDone(outcome) => self.commit_done(ctx, outcome),
                    _ => Action::Reply(Reply::new(421, "Service unavailable, try again later")),
                }
            }
            _ => {}
        }

        match event {
            Event::Connected => {
                if ctx.state == Init {
                    ctx.state = Greeted;
                    Action::Reply(Reply::new(
                        220,
                        format!("{} {}", self.config.hostname, self.config.greeting),
                    ))
                } else {
                    self.strike(ctx, Reply::new(503, "Bad sequence of commands"))
                }
            }

            // Global commands, valid in every non-terminal state.
            Event::Quit => Action::Hangup(Reply::new(221, "Bye")),
            Event::Noop => Action::Reply(Reply::new(250, "Ok")),
            Event::Rset => self.rset(ctx),
            Event::Vrfy => Action::Reply(Reply::new(252, "VRFY disabled")),
            Event::StartTls => Action::Reply(Reply::new(504, "Already in TLS mode")),
            Event::Timeout => Action::Hangup(Reply::new(421, "Timeout")),
            Event::Unknown(_) => self.strike(ctx, Reply::new(500, "Command unrecognized")),

            Event::Error(reason) => {
                if ctx.state == InData {
                    // The only framing fault in DATA is a line that outgrew
                    // the size budget.
                    ctx.clear_transaction();
                    ctx.state = AwaitingMailFrom;
                    Action::Reply(Reply::new(552, "Message size exceeds fixed limit"))
                } else {
                    self.strike(ctx, Reply::new(500, reason))
                }
            }

            Event::Ehlo(domain) => match ctx.state {
                Greeted | AwaitingEhlo => self.ehlo(ctx, domain),
                _ => self.strike(ctx, Reply::new(503, "Bad sequence of commands")),
            },

            Event::Auth(args) => match ctx.state {
                AwaitingAuth => self.auth_command(ctx, &args),
                AwaitingMailFrom if !ctx.is_authenticated => self.auth_command(ctx, &args),
                AwaitingAuthUser => self.auth_first_response(ctx, &args),
                AwaitingAuthPass => self.auth_second_response(ctx, &args),
                _ => self.strike(ctx, Reply::new(503, "Bad sequence of commands")),
            },

            Event::MailFrom(args) => match ctx.state {
                AwaitingAuth => self.strike(ctx, Reply::new(530, "Authentication required")),
                AwaitingMailFrom => self.mail_from(ctx, &args),
                _ => self.strike(ctx, Reply::new(503, "Bad sequence of commands")),
            },

            Event::RcptTo(args) => match ctx.state {
                AwaitingRcptTo | AwaitingData => self.rcpt_to(ctx, &args),
                _ => self.strike(ctx, Reply::new(503, "Bad sequence of commands")),
            },

            Event::Data(args) => match ctx.state {
                AwaitingData => {
                    if args.is_empty() {
                        ctx.message = Vec::with_capacity(1024);
                        ctx.state = InData;
                        Action::Reply(Reply::new(
                            354,
                            "Start mail input; end with <CRLF>.<CRLF>",
                        ))
                    } else {
                        self.strike(
                            ctx,
                            Reply::new(501, "Syntax error in parameters or arguments"),
                        )
                    }
                }
                _ => self.strike(ctx, Reply::new(503, "Bad sequence of commands")),
            },

            Event::DataLine(line) => {
                if ctx.state == InData {
                    self.data_line(ctx, &line)
                } else {
                    Action::Silent
                }
            }

            Event::DataEnd => {
                if ctx.state == InData {
                    ctx.state = Committing;
                    Action::Defer(DeferredOp::Commit(ReceivedMessage {
                        sender: std::mem::take(&mut ctx.sender),
                        recipients: std::mem::take(&mut ctx.recipients),
                        body: std::mem::take(&mut ctx.message),
                    }))
                } else {
                    Action::Silent
                }
            }

            // Outcome events are only meaningful in the deferred states
            // handled above.
            Event::AuthDone(_) | Event::CommitDone(_) => Action::Silent,
        }
    }

    fn ehlo(&self, ctx: &mut SessionContext, domain: String) -> Action {
        if domain.is_empty() {
            return self.strike(
                ctx,
                Reply::new(501, "Syntax error in parameters or arguments"),
            );
        }

        ctx.peer_hello = domain;
        ctx.state = self.idle_state(ctx);

        Action::Reply(Reply::multiline(
            250,
            vec![
                format!("{} Hello", self.config.hostname),
                format!("SIZE {}", self.config.max_message_size),
                "AUTH LOGIN PLAIN".to_string(),
                "8BITMIME".to_string(),
                "SMTPUTF8".to_string(),
            ],
        ))
    }

    /// The state an idle session (no open transaction, no pending AUTH
    /// exchange) belongs in.
    fn idle_state(&self, ctx: &SessionContext) -> SessionState {
        if self.config.require_auth && !ctx.is_authenticated {
            SessionState::AwaitingAuth
        } else {
            SessionState::AwaitingMailFrom
        }
    }

    fn rset(&self, ctx: &mut SessionContext) -> Action {
        ctx.clear_transaction();
        ctx.clear_auth_exchange();
        if !ctx.peer_hello.is_empty() {
            ctx.state = self.idle_state(ctx);
        }
        Action::Reply(Reply::new(250, "Ok"))
    }

    fn auth_command(&self, ctx: &mut SessionContext, args: &str) -> Action {
        if ctx.is_authenticated {
            return self.strike(ctx, Reply::new(503, "Already authenticated"));
        }

        let (mechanism, initial) = match args.split_once(char::is_whitespace) {
            Some((mechanism, initial)) => (mechanism, initial.trim()),
            None => (args, ""),
        };

        match mechanism.to_ascii_uppercase().as_str() {
            "LOGIN" => {
                ctx.auth_mechanism = Some(AuthMechanism::Login);
                if initial.is_empty() {
                    ctx.state = SessionState::AwaitingAuthUser;
                    // "Username:"
                    Action::Reply(Reply::new(334, "VXNlcm5hbWU6"))
                } else {
                    self.login_username(ctx, initial)
                }
            }
            "PLAIN" => {
                ctx.auth_mechanism = Some(AuthMechanism::Plain);
                if initial.is_empty() {
                    ctx.state = SessionState::AwaitingAuthUser;
                    Action::Reply(Reply::new(334, ""))
                } else {
                    self.plain_response(ctx, initial)
                }
            }
            _ => {
                ctx.clear_auth_exchange();
                self.strike(ctx, Reply::new(504, "Unrecognized authentication type"))
            }
        }
    }

    fn auth_first_response(&self, ctx: &mut SessionContext, line: &str) -> Action {
        match ctx.auth_mechanism {
            Some(AuthMechanism::Login) => self.login_username(ctx, line),
            Some(AuthMechanism::Plain) => self.plain_response(ctx, line),
            None => self.abort_auth(ctx, Reply::new(503, "Bad sequence of commands")),
        }
    }

    fn auth_second_response(&self, ctx: &mut SessionContext, line: &str) -> Action {
        match decode_base64(line) {
            Some(secret) => {
                ctx.auth_secret = secret;
                ctx.state = SessionState::VerifyingCredentials;
                Action::Defer(DeferredOp::VerifyCredentials {
                    username: ctx.auth_username.clone(),
                    secret: ctx.auth_secret.clone(),
                })
            }
            None => self.abort_auth(ctx, Reply::new(501, "Invalid base64 response")),
        }
    }

    fn login_username(&self, ctx: &mut SessionContext, line: &str) -> Action {
        match decode_base64(line) {
            Some(username) => {
                ctx.auth_username = username;
                ctx.state = SessionState::AwaitingAuthPass;
                // "Password:"
                Action::Reply(Reply::new(334, "UGFzc3dvcmQ6"))
            }
            None => self.abort_auth(ctx, Reply::new(501, "Invalid base64 response")),
        }
    }

    /// Decode the `authzid NUL authcid NUL passwd` blob of AUTH PLAIN.
    fn plain_response(&self, ctx: &mut SessionContext, line: &str) -> Action {
        let blob = match general_purpose::STANDARD.decode(line.as_bytes()) {
            Ok(blob) => blob,
            Err(_) => return self.abort_auth(ctx, Reply::new(501, "Invalid base64 response")),
        };

        let parts: Vec<&[u8]> = blob.split(|b| *b == 0).collect();
        let (username, secret) = match parts.as_slice() {
            [_authzid, username, secret] => {
                match (
                    std::str::from_utf8(username),
                    std::str::from_utf8(secret),
                ) {
                    (Ok(username), Ok(secret)) => (username.to_string(), secret.to_string()),
                    _ => {
                        return self
                            .abort_auth(ctx, Reply::new(501, "Invalid AUTH PLAIN response"))
                    }
                }
            }
            _ => return self.abort_auth(ctx, Reply::new(501, "Invalid AUTH PLAIN response")),
        };

        ctx.auth_username = username;
        ctx.auth_secret = secret;
        ctx.state = SessionState::VerifyingCredentials;
        Action::Defer(DeferredOp::VerifyCredentials {
            username: ctx.auth_username.clone(),
            secret: ctx.auth_secret.clone(),
        })
    }

    fn abort_auth(&self, ctx: &mut SessionContext, reply: Reply) -> Action {
        ctx.clear_auth_exchange();
        ctx.state = self.idle_state(ctx);
        self.strike(ctx, reply)
    }

    fn auth_done(&self, ctx: &mut SessionContext, outcome: AuthOutcome) -> Action {
        ctx.clear_auth_exchange();
        match outcome {
            AuthOutcome::Accepted => {
                ctx.is_authenticated = true;
                ctx.auth_failures = 0;
                ctx.state = SessionState::AwaitingMailFrom;
                Action::Reply(Reply::new(235, "Authentication successful"))
            }
            AuthOutcome::Rejected => {
                ctx.auth_failures += 1;
                if ctx.auth_failures >= self.config.max_auth_attempts {
                    Action::Hangup(Reply::new(535, "Authentication failed"))
                } else {
                    ctx.state = self.idle_state(ctx);
                    Action::Reply(Reply::new(535, "Authentication failed"))
                }
            }
            AuthOutcome::Unavailable => {
                ctx.state = self.idle_state(ctx);
                Action::Reply(Reply::new(454, "Temporary authentication failure"))
            }
        }
    }

    fn mail_from(&self, ctx: &mut SessionContext, args: &str) -> Action {
        match parse_path_argument(args, "FROM") {
            Some(address) if is_valid_address(address) => {
                ctx.sender = canonical_address(address);
                ctx.state = SessionState::AwaitingRcptTo;
                Action::Reply(Reply::new(250, "Ok"))
            }
            _ => self.strike(
                ctx,
                Reply::new(501, "Syntax error in parameters or arguments"),
            ),
        }
    }

    fn rcpt_to(&self, ctx: &mut SessionContext, args: &str) -> Action {
        match parse_path_argument(args, "TO") {
            Some(address) if is_valid_address(address) => {
                if ctx.recipients.len() >= self.config.max_recipients {
                    Action::Reply(Reply::new(452, "Too many recipients"))
                } else {
                    ctx.recipients.push(canonical_address(address));
                    ctx.state = SessionState::AwaitingData;
                    Action::Reply(Reply::new(250, "Ok"))
                }
            }
            _ => self.strike(
                ctx,
                Reply::new(501, "Syntax error in parameters or arguments"),
            ),
        }
    }

    fn data_line(&self, ctx: &mut SessionContext, line: &[u8]) -> Action {
        // Dot-stuffing: one leading dot is stripped; the bare dot never
        // reaches this point.
        let line = line.strip_prefix(b".").unwrap_or(line);

        if ctx.message.len() + line.len() + 2 > self.config.max_message_size {
            ctx.clear_transaction();
            ctx.state = SessionState::AwaitingMailFrom;
            return Action::Reply(Reply::new(552, "Message size exceeds fixed limit"));
        }

        ctx.message.extend_from_slice(line);
        ctx.message.extend_from_slice(b"\r\n");
        Action::Silent
    }

    fn commit_done(&self, ctx: &mut SessionContext, outcome: CommitOutcome) -> Action {
        // Transaction fields were taken when the commit was dispatched;
        // the context is already clean for the next MAIL FROM.
        ctx.state = SessionState::AwaitingMailFrom;
        match outcome {
            CommitOutcome::Stored(_) => Action::Reply(Reply::new(250, "Ok")),
            CommitOutcome::Unavailable => {
                Action::Reply(Reply::new(451, "Local error in processing"))
            }
            CommitOutcome::Failed => Action::Reply(Reply::new(554, "Transaction failed")),
        }
    }

    fn strike(&self, ctx: &mut SessionContext, reply: Reply) -> Action {
        ctx.error_strikes += 1;
        if ctx.error_strikes > MAX_ERROR_STRIKES {
            Action::Hangup(Reply::new(421, "Too many errors"))
        } else {
            Action::Reply(reply)
        }
    }
}

fn decode_base64(line: &str) -> Option<String> {
    general_purpose::STANDARD
        .decode(line.as_bytes())
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
}

#[cfg(test)]
mod test {
    use super::*;

    fn config() -> Configuration {
        Configuration {
            hostname: "mail.test".to_string(),
            require_auth: true,
            ..Configuration::default()
        }
    }

    fn machine(config: Configuration) -> StateMachine {
        StateMachine::new(Arc::new(config))
    }

    fn reply_code(action: &Action) -> u16 {
        match action {
            Action::Reply(reply) | Action::Hangup(reply) => reply.code,
            other => panic!("expected a reply, got {other:?}"),
        }
    }

    /// Drive a fresh context through connect + EHLO.
    fn greeted(fsm: &StateMachine) -> SessionContext {
        let mut ctx = SessionContext::new();
        assert_eq!(
            reply_code(&fsm.dispatch(&mut ctx, Event::Connected)),
            220
        );
        ctx.greeting_sent();
        let action = fsm.dispatch(&mut ctx, Event::Ehlo("client.example".to_string()));
        assert_eq!(reply_code(&action), 250);
        ctx
    }

    /// Drive a fresh context through EHLO + AUTH LOGIN with an accepting
    /// credential check.
    fn authenticated(fsm: &StateMachine) -> SessionContext {
        let mut ctx = greeted(fsm);
        fsm.dispatch(&mut ctx, Event::Auth("LOGIN".to_string()));
        fsm.dispatch(&mut ctx, Event::Auth("dXNlcg==".to_string()));
        let action = fsm.dispatch(&mut ctx, Event::Auth("cGFzcw==".to_string()));
        assert!(matches!(action, Action::Defer(_)));
        let action = fsm.dispatch(&mut ctx, Event::AuthDone(AuthOutcome::Accepted));
        assert_eq!(reply_code(&action), 235);
        ctx
    }

    #[test]
    fn happy_path_login_transaction() {
        let fsm = machine(config());
        let mut ctx = SessionContext::new();

        assert_eq!(reply_code(&fsm.dispatch(&mut ctx, Event::Connected)), 220);
        assert_eq!(ctx.state, SessionState::Greeted);
        ctx.greeting_sent();
        assert_eq!(ctx.state, SessionState::AwaitingEhlo);

        let ehlo = fsm.dispatch(&mut ctx, Event::Ehlo("client.example".to_string()));
        match &ehlo {
            Action::Reply(reply) => {
                assert_eq!(reply.code, 250);
                assert_eq!(reply.lines[0], "mail.test Hello");
                assert!(reply.lines.contains(&"AUTH LOGIN PLAIN".to_string()));
                assert!(reply.lines.last().unwrap().contains("SMTPUTF8"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(ctx.state, SessionState::AwaitingAuth);
        assert_eq!(ctx.peer_hello, "client.example");

        let action = fsm.dispatch(&mut ctx, Event::Auth("LOGIN".to_string()));
        assert_eq!(action, Action::Reply(Reply::new(334, "VXNlcm5hbWU6")));

        let action = fsm.dispatch(&mut ctx, Event::Auth("dXNlcg==".to_string()));
        assert_eq!(action, Action::Reply(Reply::new(334, "UGFzc3dvcmQ6")));

        let action = fsm.dispatch(&mut ctx, Event::Auth("cGFzcw==".to_string()));
        assert_eq!(
            action,
            Action::Defer(DeferredOp::VerifyCredentials {
                username: "user".to_string(),
                secret: "pass".to_string(),
            })
        );
        assert_eq!(ctx.state, SessionState::VerifyingCredentials);

        let action = fsm.dispatch(&mut ctx, Event::AuthDone(AuthOutcome::Accepted));
        assert_eq!(reply_code(&action), 235);
        assert!(ctx.is_authenticated);
        assert_eq!(ctx.state, SessionState::AwaitingMailFrom);

        let action = fsm.dispatch(&mut ctx, Event::MailFrom("FROM:<a@x.test>".to_string()));
        assert_eq!(reply_code(&action), 250);
        assert_eq!(ctx.sender, "a@x.test");
        assert_eq!(ctx.state, SessionState::AwaitingRcptTo);

        let action = fsm.dispatch(&mut ctx, Event::RcptTo("TO:<b@y.test>".to_string()));
        assert_eq!(reply_code(&action), 250);
        assert_eq!(ctx.state, SessionState::AwaitingData);

        let action = fsm.dispatch(&mut ctx, Event::Data(String::new()));
        assert_eq!(reply_code(&action), 354);
        assert_eq!(ctx.state, SessionState::InData);

        for line in [&b"Subject: hi"[..], b"", b"body"] {
            assert_eq!(
                fsm.dispatch(&mut ctx, Event::DataLine(line.to_vec())),
                Action::Silent
            );
        }

        let action = fsm.dispatch(&mut ctx, Event::DataEnd);
        match action {
            Action::Defer(DeferredOp::Commit(message)) => {
                assert_eq!(message.sender, "a@x.test");
                assert_eq!(message.recipients, ["b@y.test"]);
                assert_eq!(message.body, b"Subject: hi\r\n\r\nbody\r\n");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(ctx.state, SessionState::Committing);
        assert!(ctx.sender.is_empty());
        assert!(ctx.recipients.is_empty());
        assert!(ctx.message.is_empty());

        let action = fsm.dispatch(&mut ctx, Event::CommitDone(CommitOutcome::Stored(1)));
        assert_eq!(reply_code(&action), 250);
        assert_eq!(ctx.state, SessionState::AwaitingMailFrom);

        let action = fsm.dispatch(&mut ctx, Event::Quit);
        assert_eq!(action, Action::Hangup(Reply::new(221, "Bye")));
        assert_eq!(ctx.state, SessionState::AwaitingQuit);
    }

    #[test]
    fn auth_plain_inline_response() {
        let fsm = machine(config());
        let mut ctx = greeted(&fsm);

        // "\0user\0pass"
        let action = fsm.dispatch(
            &mut ctx,
            Event::Auth("PLAIN AHVzZXIAcGFzcw==".to_string()),
        );
        assert_eq!(
            action,
            Action::Defer(DeferredOp::VerifyCredentials {
                username: "user".to_string(),
                secret: "pass".to_string(),
            })
        );
    }

    #[test]
    fn auth_plain_challenge_flow() {
        let fsm = machine(config());
        let mut ctx = greeted(&fsm);

        let action = fsm.dispatch(&mut ctx, Event::Auth("PLAIN".to_string()));
        assert_eq!(action, Action::Reply(Reply::new(334, "")));
        assert_eq!(ctx.state, SessionState::AwaitingAuthUser);

        let action = fsm.dispatch(&mut ctx, Event::Auth("AHVzZXIAcGFzcw==".to_string()));
        assert!(matches!(
            action,
            Action::Defer(DeferredOp::VerifyCredentials { .. })
        ));
    }

    #[test]
    fn unknown_auth_mechanism() {
        let fsm = machine(config());
        let mut ctx = greeted(&fsm);

        let action = fsm.dispatch(&mut ctx, Event::Auth("CRAM-MD5".to_string()));
        assert_eq!(reply_code(&action), 504);
    }

    #[test]
    fn rejected_credentials_allow_retry_until_the_limit() {
        let fsm = machine(Configuration {
            max_auth_attempts: 2,
            ..config()
        });
        let mut ctx = greeted(&fsm);

        fsm.dispatch(&mut ctx, Event::Auth("PLAIN AHVzZXIAcGFzcw==".to_string()));
        let action = fsm.dispatch(&mut ctx, Event::AuthDone(AuthOutcome::Rejected));
        assert_eq!(action, Action::Reply(Reply::new(535, "Authentication failed")));
        assert_eq!(ctx.state, SessionState::AwaitingAuth);

        fsm.dispatch(&mut ctx, Event::Auth("PLAIN AHVzZXIAcGFzcw==".to_string()));
        let action = fsm.dispatch(&mut ctx, Event::AuthDone(AuthOutcome::Rejected));
        assert_eq!(action, Action::Hangup(Reply::new(535, "Authentication failed")));
        assert_eq!(ctx.state, SessionState::AwaitingQuit);
    }

    #[test]
    fn auth_infrastructure_failure_is_transient() {
        let fsm = machine(config());
        let mut ctx = greeted(&fsm);

        fsm.dispatch(&mut ctx, Event::Auth("PLAIN AHVzZXIAcGFzcw==".to_string()));
        let action = fsm.dispatch(&mut ctx, Event::AuthDone(AuthOutcome::Unavailable));
        assert_eq!(reply_code(&action), 454);
        assert_eq!(ctx.auth_failures, 0);
        assert_eq!(ctx.state, SessionState::AwaitingAuth);
    }

    #[test]
    fn mail_without_auth_is_rejected_when_auth_is_required() {
        let fsm = machine(config());
        let mut ctx = greeted(&fsm);

        let action = fsm.dispatch(&mut ctx, Event::MailFrom("FROM:<a@x.test>".to_string()));
        assert_eq!(reply_code(&action), 530);
        assert!(ctx.sender.is_empty());
    }

    #[test]
    fn out_of_order_rcpt_is_a_sequence_error() {
        let fsm = machine(Configuration {
            require_auth: false,
            ..config()
        });
        let mut ctx = greeted(&fsm);

        let action = fsm.dispatch(&mut ctx, Event::RcptTo("TO:<b@y.test>".to_string()));
        assert_eq!(
            action,
            Action::Reply(Reply::new(503, "Bad sequence of commands"))
        );
        assert!(ctx.sender.is_empty());
        assert!(ctx.recipients.is_empty());
    }

    #[test]
    fn data_requires_a_recipient() {
        let fsm = machine(Configuration {
            require_auth: false,
            ..config()
        });
        let mut ctx = greeted(&fsm);

        fsm.dispatch(&mut ctx, Event::MailFrom("FROM:<a@x.test>".to_string()));
        let action = fsm.dispatch(&mut ctx, Event::Data(String::new()));
        assert_eq!(reply_code(&action), 503);
    }

    #[test]
    fn recipient_cap_answers_452() {
        let fsm = machine(Configuration {
            require_auth: false,
            max_recipients: 2,
            ..config()
        });
        let mut ctx = greeted(&fsm);

        fsm.dispatch(&mut ctx, Event::MailFrom("FROM:<a@x.test>".to_string()));
        for n in 0..2 {
            let action =
                fsm.dispatch(&mut ctx, Event::RcptTo(format!("TO:<r{n}@y.test>")));
            assert_eq!(reply_code(&action), 250);
        }

        let action = fsm.dispatch(&mut ctx, Event::RcptTo("TO:<r2@y.test>".to_string()));
        assert_eq!(action, Action::Reply(Reply::new(452, "Too many recipients")));
        assert_eq!(ctx.recipients.len(), 2);
    }

    #[test]
    fn size_cap_discards_and_resets() {
        let fsm = machine(Configuration {
            require_auth: false,
            max_message_size: 100,
            ..config()
        });
        let mut ctx = greeted(&fsm);

        fsm.dispatch(&mut ctx, Event::MailFrom("FROM:<a@x.test>".to_string()));
        fsm.dispatch(&mut ctx, Event::RcptTo("TO:<b@y.test>".to_string()));
        fsm.dispatch(&mut ctx, Event::Data(String::new()));

        let chunk = vec![b'x'; 80];
        assert_eq!(
            fsm.dispatch(&mut ctx, Event::DataLine(chunk.clone())),
            Action::Silent
        );
        let action = fsm.dispatch(&mut ctx, Event::DataLine(chunk));
        assert_eq!(
            action,
            Action::Reply(Reply::new(552, "Message size exceeds fixed limit"))
        );
        assert_eq!(ctx.state, SessionState::AwaitingMailFrom);
        assert!(ctx.message.is_empty());
        assert!(ctx.sender.is_empty());
    }

    #[test]
    fn four_strikes_close_the_session() {
        let fsm = machine(config());
        let mut ctx = greeted(&fsm);

        for _ in 0..3 {
            let action = fsm.dispatch(&mut ctx, Event::Unknown("XYZZY".to_string()));
            assert_eq!(reply_code(&action), 500);
        }
        let action = fsm.dispatch(&mut ctx, Event::Unknown("XYZZY".to_string()));
        assert_eq!(action, Action::Hangup(Reply::new(421, "Too many errors")));
        assert_eq!(ctx.state, SessionState::AwaitingQuit);
    }

    #[test]
    fn successful_command_resets_the_strike_counter() {
        let fsm = machine(config());
        let mut ctx = greeted(&fsm);

        for _ in 0..3 {
            fsm.dispatch(&mut ctx, Event::Unknown("XYZZY".to_string()));
        }
        assert_eq!(reply_code(&fsm.dispatch(&mut ctx, Event::Noop)), 250);
        assert_eq!(ctx.error_strikes, 0);

        let action = fsm.dispatch(&mut ctx, Event::Unknown("XYZZY".to_string()));
        assert_eq!(reply_code(&action), 500);
        assert_ne!(ctx.state, SessionState::AwaitingQuit);
    }

    #[test]
    fn dot_stuffing_strips_one_leading_dot() {
        let fsm = machine(Configuration {
            require_auth: false,
            ..config()
        });
        let mut ctx = greeted(&fsm);

        fsm.dispatch(&mut ctx, Event::MailFrom("FROM:<a@x.test>".to_string()));
        fsm.dispatch(&mut ctx, Event::RcptTo("TO:<b@y.test>".to_string()));
        fsm.dispatch(&mut ctx, Event::Data(String::new()));
        fsm.dispatch(&mut ctx, Event::DataLine(b"..hidden".to_vec()));
        fsm.dispatch(&mut ctx, Event::DataLine(b".also".to_vec()));

        let action = fsm.dispatch(&mut ctx, Event::DataEnd);
        match action {
            Action::Defer(DeferredOp::Commit(message)) => {
                assert_eq!(message.body, b".hidden\r\nalso\r\n");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn rset_clears_the_transaction_but_not_the_identity() {
        let fsm = machine(config());
        let mut ctx = authenticated(&fsm);

        fsm.dispatch(&mut ctx, Event::MailFrom("FROM:<a@x.test>".to_string()));
        fsm.dispatch(&mut ctx, Event::RcptTo("TO:<b@y.test>".to_string()));

        let action = fsm.dispatch(&mut ctx, Event::Rset);
        assert_eq!(reply_code(&action), 250);
        assert!(ctx.sender.is_empty());
        assert!(ctx.recipients.is_empty());
        assert!(ctx.message.is_empty());
        assert_eq!(ctx.peer_hello, "client.example");
        assert!(ctx.is_authenticated);
        assert_eq!(ctx.state, SessionState::AwaitingMailFrom);
    }

    #[test]
    fn commit_failure_resets_for_retry() {
        let fsm = machine(Configuration {
            require_auth: false,
            ..config()
        });
        let mut ctx = greeted(&fsm);

        fsm.dispatch(&mut ctx, Event::MailFrom("FROM:<a@x.test>".to_string()));
        fsm.dispatch(&mut ctx, Event::RcptTo("TO:<b@y.test>".to_string()));
        fsm.dispatch(&mut ctx, Event::Data(String::new()));
        fsm.dispatch(&mut ctx, Event::DataLine(b"body".to_vec()));
        assert!(matches!(
            fsm.dispatch(&mut ctx, Event::DataEnd),
            Action::Defer(_)
        ));

        let action = fsm.dispatch(&mut ctx, Event::CommitDone(CommitOutcome::Failed));
        assert_eq!(action, Action::Reply(Reply::new(554, "Transaction failed")));
        assert_eq!(ctx.state, SessionState::AwaitingMailFrom);

        // The client may immediately start over.
        let action = fsm.dispatch(&mut ctx, Event::MailFrom("FROM:<a@x.test>".to_string()));
        assert_eq!(reply_code(&action), 250);
    }

    #[test]
    fn deferred_states_guard_with_421() {
        let fsm = machine(config());
        let mut ctx = greeted(&fsm);

        fsm.dispatch(&mut ctx, Event::Auth("PLAIN AHVzZXIAcGFzcw==".to_string()));
        assert_eq!(ctx.state, SessionState::VerifyingCredentials);

        let action = fsm.dispatch(&mut ctx, Event::Noop);
        assert_eq!(reply_code(&action), 421);
        assert_eq!(ctx.state, SessionState::VerifyingCredentials);
    }

    #[test]
    fn timeout_closes_with_421() {
        let fsm = machine(config());
        let mut ctx = greeted(&fsm);

        let action = fsm.dispatch(&mut ctx, Event::Timeout);
        assert_eq!(action, Action::Hangup(Reply::new(421, "Timeout")));
    }

    #[test]
    fn invalid_addresses_are_syntax_errors() {
        let fsm = machine(Configuration {
            require_auth: false,
            ..config()
        });
        let mut ctx = greeted(&fsm);

        for args in [
            "a@x.test",            // no angle brackets
            "FROM:<not-an-address>",
            "FROM:<a@@x.test>",
            "FROM:<>",
        ] {
            let action = fsm.dispatch(&mut ctx, Event::MailFrom(args.to_string()));
            assert_eq!(reply_code(&action), 501, "{args} should be rejected");
            ctx.error_strikes = 0;
        }
    }

    #[test]
    fn same_event_sequence_is_deterministic() {
        let fsm = machine(Configuration {
            require_auth: false,
            ..config()
        });

        let sequence = || {
            vec![
                Event::Connected,
                Event::Ehlo("client.example".to_string()),
                Event::MailFrom("FROM:<a@x.test>".to_string()),
                Event::Noop,
                Event::RcptTo("TO:<b@y.test>".to_string()),
                Event::Unknown("BDAT".to_string()),
                Event::Data(String::new()),
                Event::DataLine(b"Subject: x".to_vec()),
                Event::DataEnd,
                Event::CommitDone(CommitOutcome::Stored(7)),
                Event::Quit,
            ]
        };

        let mut first = SessionContext::new();
        let mut second = SessionContext::new();
        let replies_first: Vec<Action> = sequence()
            .into_iter()
            .map(|event| fsm.dispatch(&mut first, event))
            .collect();
        let replies_second: Vec<Action> = sequence()
            .into_iter()
            .map(|event| fsm.dispatch(&mut second, event))
            .collect();

        assert_eq!(replies_first, replies_second);
        assert_eq!(first.state, second.state);
    }
}
