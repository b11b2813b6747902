use std::cmp::Reverse;

use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::notify::{Notice, Topic};
use crate::observability;

use super::{Engine, EngineError};

/// Bookings whose threads count toward the unread roll-up.
fn counts_for_unread(status: BookingStatus) -> bool {
    matches!(
        status,
        BookingStatus::Pending | BookingStatus::Confirmed | BookingStatus::Completed
    )
}

/// Unread when someone else wrote the latest message after the reader's mark.
fn is_unread(last: Option<&BookingMessage>, mark: Option<Ms>, reader: Ulid) -> bool {
    match last {
        Some(m) if m.sender_id != reader => mark.is_none_or(|at| at < m.created_at),
        _ => false,
    }
}

impl Engine {
    /// Thread in chronological order. Listing moves the caller's read mark up to
    /// the newest message returned (never past `now`), so a message that lands
    /// after the read stays unread.
    pub async fn list_messages(
        &self,
        caller: &Caller,
        booking_id: &Ulid,
        now: Ms,
    ) -> Result<Vec<BookingMessage>, EngineError> {
        let booking = self.find_booking(booking_id).await?;
        if !booking.visible_to(caller) {
            return Err(EngineError::Forbidden("read messages on this booking"));
        }
        let messages = self
            .store
            .thread(booking_id)
            .map(|t| t.messages)
            .unwrap_or_default();
        let Some(newest) = messages.iter().map(|m| m.created_at).max() else {
            return Ok(messages);
        };

        let _commit = self.commit_gate.read().await;
        self.persist_shared(&Event::ThreadRead {
            booking_id: *booking_id,
            reader_id: caller.id,
            at: newest.min(now),
        })
        .await?;
        Ok(messages)
    }

    pub async fn send_message(
        &self,
        caller: &Caller,
        booking_id: &Ulid,
        content: &str,
        now: Ms,
    ) -> Result<BookingMessage, EngineError> {
        let booking = self.find_booking(booking_id).await?;
        if !booking.is_participant(caller.id) {
            return Err(EngineError::Forbidden("post messages on this booking"));
        }
        let content = content.trim();
        if content.is_empty() {
            return Err(EngineError::Invalid("message content is empty".into()));
        }
        if content.chars().count() > MAX_MESSAGE_LEN {
            return Err(EngineError::LimitExceeded("message longer than 2000 characters"));
        }
        if self.store.message_count(booking_id) >= MAX_MESSAGES_PER_BOOKING {
            return Err(EngineError::LimitExceeded("too many messages on booking"));
        }

        let message = BookingMessage {
            id: Ulid::new(),
            booking_id: *booking_id,
            sender_id: caller.id,
            content: content.to_string(),
            created_at: now,
        };
        let commit = self.commit_gate.read().await;
        self.persist_shared(&Event::MessagePosted(message.clone()))
            .await?;
        drop(commit);

        metrics::counter!(observability::MESSAGES_SENT_TOTAL).increment(1);
        tracing::debug!(%booking_id, message_id = %message.id, sender = %caller.id, "message posted");
        self.notify.send(
            Topic::Booking(*booking_id),
            &Notice::MessagePosted {
                booking_id: *booking_id,
                message_id: message.id,
            },
        );
        Ok(message)
    }

    /// One row per participated booking whose latest message the caller has not
    /// read. Newest message first; ties newest booking id first.
    pub async fn unread_summaries(&self, caller: &Caller) -> Vec<UnreadSummary> {
        let bookings = self
            .list_bookings(caller, super::BookingRole::All, None)
            .await;
        let mut rows: Vec<UnreadSummary> = bookings
            .into_iter()
            .filter(|b| b.is_participant(caller.id) && counts_for_unread(b.status))
            .filter_map(|b| {
                let (last, mark) = self.store.thread_head(&b.id, &caller.id);
                if !is_unread(last.as_ref(), mark, caller.id) {
                    return None;
                }
                Some(UnreadSummary {
                    booking_id: b.id,
                    other_party_id: b.counterpart(caller.id),
                    last_message: last?,
                })
            })
            .collect();
        rows.sort_by_key(|r| Reverse((r.last_message.created_at, r.booking_id)));
        rows
    }

    /// Inbox view: every participated booking, unread first, then most recent
    /// activity (latest message, else lesson start) first.
    pub async fn conversations(&self, caller: &Caller) -> Vec<ConversationSummary> {
        let bookings = self
            .list_bookings(caller, super::BookingRole::All, None)
            .await;
        let mut rows: Vec<ConversationSummary> = bookings
            .into_iter()
            .filter(|b| b.is_participant(caller.id) && counts_for_unread(b.status))
            .map(|b| {
                let (last, mark) = self.store.thread_head(&b.id, &caller.id);
                let unread = is_unread(last.as_ref(), mark, caller.id);
                ConversationSummary {
                    other_party_id: b.counterpart(caller.id),
                    booking: b,
                    last_message: last,
                    unread,
                }
            })
            .collect();
        rows.sort_by_key(|r| (Reverse(r.unread), Reverse(r.last_activity()), Reverse(r.booking.id)));
        rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(sender: Ulid, at: Ms) -> BookingMessage {
        BookingMessage {
            id: Ulid::new(),
            booking_id: Ulid::new(),
            sender_id: sender,
            content: "hi".into(),
            created_at: at,
        }
    }

    #[test]
    fn own_message_is_never_unread() {
        let me = Ulid::new();
        assert!(!is_unread(Some(&message(me, 10)), None, me));
    }

    #[test]
    fn mark_before_message_is_unread() {
        let me = Ulid::new();
        let other = message(Ulid::new(), 10);
        assert!(is_unread(Some(&other), None, me));
        assert!(is_unread(Some(&other), Some(9), me));
        assert!(!is_unread(Some(&other), Some(10), me));
        assert!(!is_unread(None, None, me));
    }

    #[test]
    fn declined_threads_are_not_counted() {
        assert!(counts_for_unread(BookingStatus::Completed));
        assert!(!counts_for_unread(BookingStatus::Declined));
        assert!(!counts_for_unread(BookingStatus::CancelledByMember));
    }
}
