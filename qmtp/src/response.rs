use crate::netstring;
use crate::policy::RecipientStatus;
use crate::queue::QueueResult;
use log::trace;
use ternop::ternary;

/// Segment sent for a recipient whose domain is not accepted here
pub const DOMAIN_NOT_ALLOWED: &[u8] =
    b"66:Dsorry, that domain isn't in my list of allowed rcpthosts (#5.7.1),";
/// Segment sent for a recipient that could not be read
pub const CANNOT_HANDLE_RECIPIENT: &[u8] = b"46:Dsorry, I can't handle that recipient (#5.1.3),";
/// Transaction status when the sender was too long or contained a NUL
pub const UNACCEPTABLE_SENDER: &str = "Dunacceptable sender (#5.1.7)";
/// Transaction status when the body was larger than the configured limit
pub const SIZE_EXCEEDED: &str = "Dsorry, that message size exceeds my databytes limit (#5.3.4)";

/// The per-transaction reply sent to the client
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reply {
    /// Status line shared by every accepted recipient
    pub status: String,
    /// One framed segment per recipient, concatenated
    pub encoded: Vec<u8>,
}

impl Reply {
    /// Build the reply from the queue outcome and what was seen on the wire.
    ///
    /// An oversized body beats a bad sender, and both beat whatever the queue
    /// reported.
    pub fn new(
        result: &QueueResult,
        sender_malformed: bool,
        size_exceeded: bool,
        recipients: &[RecipientStatus],
    ) -> Self {
        let status = if size_exceeded {
            SIZE_EXCEEDED.to_owned()
        } else if sender_malformed {
            UNACCEPTABLE_SENDER.to_owned()
        } else {
            result.line()
        };
        let line = netstring::encode(status.as_bytes());
        let mut encoded = Vec::with_capacity(line.len() * recipients.len());
        for status in recipients {
            let segment = match status {
                RecipientStatus::Accepted => &line[..],
                RecipientStatus::DomainRejected => DOMAIN_NOT_ALLOWED,
                RecipientStatus::Oversized | RecipientStatus::Malformed => CANNOT_HANDLE_RECIPIENT,
            };
            encoded.extend_from_slice(segment);
        }
        Self { status, encoded }
    }

    /// Did the transaction as a whole succeed?
    pub fn is_success(&self) -> bool {
        self.status.starts_with('K')
    }

    // Log the response
    pub(crate) fn log(&self) {
        let kind = ternary!(self.is_success(), "ok", "failed");
        trace!("< {} {}", kind, String::from_utf8_lossy(&self.encoded));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use expect_test::expect;
    use RecipientStatus::*;

    fn accepted() -> QueueResult {
        QueueResult::Accepted {
            timestamp: 1_000_000_000,
            qp: 4242,
        }
    }

    #[test]
    fn fixed_segment_lengths() {
        assert_eq!(DOMAIN_NOT_ALLOWED.len(), "66:".len() + 66 + 1);
        assert_eq!(CANNOT_HANDLE_RECIPIENT.len(), "46:".len() + 46 + 1);
    }

    #[test]
    fn success_repeats_per_recipient() {
        let reply = Reply::new(&accepted(), false, false, &[Accepted, Accepted]);
        assert!(reply.is_success());
        expect![[r#"22:Kok 1000000000 qp 4242,22:Kok 1000000000 qp 4242,"#]]
            .assert_eq(&String::from_utf8_lossy(&reply.encoded));
    }

    #[test]
    fn mixed_recipients() {
        let statuses = [DomainRejected, Accepted, Oversized, Malformed];
        let reply = Reply::new(&accepted(), false, false, &statuses);
        let mut expected = DOMAIN_NOT_ALLOWED.to_vec();
        expected.extend_from_slice(b"22:Kok 1000000000 qp 4242,");
        expected.extend_from_slice(CANNOT_HANDLE_RECIPIENT);
        expected.extend_from_slice(CANNOT_HANDLE_RECIPIENT);
        assert_eq!(reply.encoded, expected);
    }

    #[test]
    fn overrides() {
        let reply = Reply::new(&accepted(), true, false, &[Accepted]);
        assert_eq!(reply.status, UNACCEPTABLE_SENDER);
        assert_eq!(reply.encoded, b"29:Dunacceptable sender (#5.1.7),");

        let reply = Reply::new(&accepted(), false, true, &[Accepted]);
        assert_eq!(reply.status, SIZE_EXCEEDED);
        assert!(!reply.is_success());

        // Size is checked last and wins
        let reply = Reply::new(&accepted(), true, true, &[Accepted]);
        assert_eq!(reply.status, SIZE_EXCEEDED);
        expect![[r#"61:Dsorry, that message size exceeds my databytes limit (#5.3.4),"#]]
            .assert_eq(&String::from_utf8_lossy(&reply.encoded));

        let temp = QueueResult::TemporaryFailure("qq timeout (#4.3.0)".into());
        let reply = Reply::new(&temp, false, false, &[Accepted]);
        assert_eq!(reply.encoded, b"20:Zqq timeout (#4.3.0),");
    }

    #[test]
    fn no_recipients_no_output() {
        let reply = Reply::new(&accepted(), false, false, &[]);
        assert!(reply.encoded.is_empty());
    }
}
