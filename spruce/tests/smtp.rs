use std::sync::{Arc, Mutex};

use spruce::{session::PasswdFlags, smtp::SmtpTransport, Error, Session, ServiceUrl};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::TcpListener,
    task::JoinHandle,
};

/// One scripted exchange: expect a command starting with a prefix,
/// then send the canned reply (which may be multiline).
enum Step {
    Expect(&'static str, &'static str),
    /// Read message payload lines until the lone `.`, then reply.
    Payload(&'static str),
}

struct TestSession {
    passwd: Option<&'static str>,
    prompts: Mutex<Vec<PasswdFlags>>,
}

impl TestSession {
    fn with_passwd(passwd: &'static str) -> Arc<Self> {
        Arc::new(Self {
            passwd: Some(passwd),
            prompts: Mutex::new(Vec::new()),
        })
    }

    fn without_passwd() -> Arc<Self> {
        Arc::new(Self {
            passwd: None,
            prompts: Mutex::new(Vec::new()),
        })
    }
}

impl Session for TestSession {
    fn alert_user(&self, _text: &str) {}

    fn request_passwd(&self, _prompt: &str, _key: &str, flags: PasswdFlags) -> Option<String> {
        self.prompts.lock().unwrap().push(flags);
        self.passwd.map(str::to_owned)
    }

    fn forget_passwd(&self, _key: &str) {}
}

/// Serve one scripted SMTP conversation, returning the raw command
/// lines the client sent.
async fn mock_server(script: Vec<Step>) -> (u16, JoinHandle<Vec<String>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let handle = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();
        let mut seen = Vec::new();

        write_half
            .write_all(b"220 mock ESMTP ready\r\n")
            .await
            .unwrap();

        for step in script {
            match step {
                Step::Expect(prefix, reply) => {
                    let line = match lines.next_line().await {
                        Ok(Some(line)) => line,
                        _ => break,
                    };
                    assert!(
                        line.starts_with(prefix),
                        "expected a {prefix} command, got {line}"
                    );
                    seen.push(line);
                    write_half.write_all(reply.as_bytes()).await.unwrap();
                }
                Step::Payload(reply) => {
                    loop {
                        let line = match lines.next_line().await {
                            Ok(Some(line)) => line,
                            _ => return seen,
                        };
                        let done = line == ".";
                        seen.push(line);
                        if done {
                            break;
                        }
                    }
                    write_half.write_all(reply.as_bytes()).await.unwrap();
                }
            }
        }

        seen
    });

    (port, handle)
}

fn transport_for(port: u16, userinfo: &str, query: &str) -> SmtpTransport {
    let url =
        ServiceUrl::parse(&format!("smtp://{userinfo}127.0.0.1:{port}{query}")).unwrap();
    SmtpTransport::new(url, TestSession::with_passwd("s3cret"))
}

#[test_log::test(tokio::test)]
async fn happy_path_with_auth_and_8bitmime() {
    let (port, server) = mock_server(vec![
        Step::Expect("EHLO", "250-mock\r\n250-8BITMIME\r\n250 AUTH PLAIN\r\n"),
        Step::Expect("AUTH PLAIN", "334 \r\n"),
        Step::Expect("", "235 2.7.0 accepted\r\n"),
        Step::Expect("EHLO", "250-mock\r\n250-8BITMIME\r\n250 AUTH PLAIN\r\n"),
        Step::Expect("MAIL FROM:", "250 sender ok\r\n"),
        Step::Expect("RCPT TO:", "250 recipient ok\r\n"),
        Step::Expect("DATA", "354 go ahead\r\n"),
        Step::Payload("250 accepted\r\n"),
        Step::Expect("RSET", "250 flushed\r\n"),
        Step::Expect("QUIT", "221 bye\r\n"),
    ])
    .await;

    let mut transport = transport_for(port, "alice;AUTH=PLAIN@", "");
    transport.connect().await.unwrap();
    assert!(transport.is_connected());

    let message = "Subject: caf\u{e9}\n\n8-bit body: d\u{e9}j\u{e0} vu\n".as_bytes();
    transport
        .send_message("alice@localhost", &["bob@remote".into()], message)
        .await
        .unwrap();
    assert!(transport.is_connected(), "send leaves the connection Ready");

    transport.disconnect(true).await.unwrap();
    assert!(!transport.is_connected());

    let seen = server.await.unwrap();
    assert!(seen
        .iter()
        .any(|line| line == "MAIL FROM:<alice@localhost> BODY=8BITMIME"));
    assert!(seen.iter().any(|line| line == "RCPT TO:<bob@remote>"));
    // the payload went out dot-terminated
    assert_eq!(seen.iter().filter(|line| *line == ".").count(), 1);
}

#[test_log::test(tokio::test)]
async fn starttls_unsupported_aborts() {
    let (port, _server) = mock_server(vec![Step::Expect(
        "EHLO",
        "250-mock\r\n250 AUTH PLAIN\r\n",
    )])
    .await;

    let mut transport = transport_for(port, "", "?starttls=yes");
    let err = transport.connect().await.unwrap_err();
    assert!(matches!(err, Error::ServiceUnavailable(_)), "{err}");
    assert!(!transport.is_connected());
}

#[test_log::test(tokio::test)]
async fn rcpt_failure_decodes_enhanced_codes_and_rsets() {
    let (port, server) = mock_server(vec![
        Step::Expect("EHLO", "250-mock\r\n250 ENHANCEDSTATUSCODES\r\n"),
        Step::Expect("MAIL FROM:", "250 2.1.0 sender ok\r\n"),
        Step::Expect(
            "RCPT TO:",
            "550-5.1.1 Mailbox+20\"nobody\"\r\n550 5.1.1 does not exist\r\n",
        ),
        Step::Expect("RSET", "250 2.0.0 flushed\r\n"),
    ])
    .await;

    let mut transport = transport_for(port, "", "");
    transport.connect().await.unwrap();

    let err = transport
        .send_message(
            "alice@localhost",
            &["nobody@remote".into()],
            b"Subject: x\n\nbody\n",
        )
        .await
        .unwrap_err();

    match err {
        Error::Protocol { code, text } => {
            assert_eq!(code, 550);
            // canonical description plus the decoded xtext
            assert!(text.contains("mailbox unavailable"), "{text}");
            assert!(text.contains("Mailbox \"nobody\""), "{text}");
        }
        other => panic!("unexpected error {other}"),
    }

    // the connection recovered to Ready
    assert!(transport.is_connected());
    transport.disconnect(false).await.unwrap();

    let seen = server.await.unwrap();
    assert!(seen.iter().any(|line| line == "RSET"));
}

#[test_log::test(tokio::test)]
async fn helo_fallback_when_ehlo_is_rejected() {
    let (port, server) = mock_server(vec![
        Step::Expect("EHLO", "502 5.5.1 not here\r\n"),
        Step::Expect("HELO", "250 mock\r\n"),
        Step::Expect("MAIL FROM:", "250 ok\r\n"),
        Step::Expect("RCPT TO:", "250 ok\r\n"),
        Step::Expect("DATA", "354 go\r\n"),
        Step::Payload("250 accepted\r\n"),
        Step::Expect("RSET", "250 ok\r\n"),
    ])
    .await;

    let mut transport = transport_for(port, "", "");
    transport.connect().await.unwrap();

    // no 8BITMIME negotiated: the 8-bit body gets re-encoded
    let message = "Subject: plain\n\nd\u{e9}j\u{e0} vu\n".as_bytes();
    transport
        .send_message("a@localhost", &["b@remote".into()], message)
        .await
        .unwrap();

    let seen = server.await.unwrap();
    assert!(seen.iter().any(|line| line == "MAIL FROM:<a@localhost>"));
    assert!(seen
        .iter()
        .any(|line| line.contains("Content-Transfer-Encoding: quoted-printable")));
    assert!(!seen.iter().any(|line| line.bytes().any(|b| b >= 0x80)));
}

#[test_log::test(tokio::test)]
async fn empty_recipient_fails_before_any_command() {
    let (port, server) = mock_server(vec![Step::Expect("EHLO", "250 mock\r\n")]).await;

    let mut transport = transport_for(port, "", "");
    transport.connect().await.unwrap();

    let err = transport
        .send_message(
            "alice@localhost",
            &["ok@remote".into(), String::new()],
            b"Subject: x\n\nbody\n",
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidRecipient(_)));

    transport.disconnect(false).await.unwrap();
    let seen = server.await.unwrap();
    assert!(
        !seen.iter().any(|line| line.starts_with("MAIL")),
        "no envelope command may reach the server: {seen:?}"
    );
}

#[test_log::test(tokio::test)]
async fn wrong_password_reprompts_then_succeeds() {
    let (port, _server) = mock_server(vec![
        Step::Expect("EHLO", "250-mock\r\n250 AUTH PLAIN LOGIN\r\n"),
        Step::Expect("AUTH PLAIN", "334 \r\n"),
        Step::Expect("", "535 5.7.8 nope\r\n"),
        Step::Expect("AUTH PLAIN", "334 \r\n"),
        Step::Expect("", "235 2.7.0 accepted\r\n"),
        Step::Expect("EHLO", "250 mock\r\n"),
    ])
    .await;

    let session = TestSession::with_passwd("eventually-right");
    let url = ServiceUrl::parse(&format!("smtp://alice;AUTH=PLAIN@127.0.0.1:{port}")).unwrap();
    let mut transport = SmtpTransport::new(url, session.clone());

    transport.connect().await.unwrap();

    let prompts = session.prompts.lock().unwrap();
    assert_eq!(prompts.len(), 2);
    assert!(!prompts[0].contains(PasswdFlags::REPROMPT));
    assert!(prompts[1].contains(PasswdFlags::REPROMPT));
}

#[test_log::test(tokio::test)]
async fn declined_password_aborts_cleanly() {
    let (port, _server) = mock_server(vec![
        Step::Expect("EHLO", "250-mock\r\n250 AUTH PLAIN\r\n"),
        Step::Expect("QUIT", "221 bye\r\n"),
    ])
    .await;

    let session = TestSession::without_passwd();
    let url = ServiceUrl::parse(&format!("smtp://alice;AUTH=PLAIN@127.0.0.1:{port}")).unwrap();
    let mut transport = SmtpTransport::new(url, session);

    let err = transport.connect().await.unwrap_err();
    assert!(matches!(err, Error::CannotAuthenticate(_)));
    assert!(!transport.is_connected());
}

#[test_log::test(tokio::test)]
async fn requested_mechanism_must_be_advertised() {
    let (port, _server) = mock_server(vec![
        Step::Expect("EHLO", "250-mock\r\n250 AUTH LOGIN\r\n"),
        Step::Expect("QUIT", "221 bye\r\n"),
    ])
    .await;

    let mut transport = transport_for(port, "alice;AUTH=PLAIN@", "");
    let err = transport.connect().await.unwrap_err();
    assert!(matches!(err, Error::CannotAuthenticate(_)), "{err}");
}

#[test_log::test(tokio::test)]
async fn broken_auth_equal_form_is_parsed() {
    let (port, _server) = mock_server(vec![
        Step::Expect("EHLO", "250-mock\r\n250 AUTH=PLAIN LOGIN\r\n"),
        Step::Expect("AUTH PLAIN", "334 \r\n"),
        Step::Expect("", "235 ok\r\n"),
        Step::Expect("EHLO", "250-mock\r\n250 AUTH=PLAIN LOGIN\r\n"),
    ])
    .await;

    let mut transport = transport_for(port, "alice;AUTH=PLAIN@", "");
    transport.connect().await.unwrap();
    assert!(transport
        .auth_types()
        .iter()
        .any(|mechanism| mechanism == "PLAIN"));
}
