//! Comm 单元测试
//!
//! 测试消息投递、序号重排与节点断开

use std::time::Duration;

use crate::runtime::comm::{CommConfig, Envelope, Fabric, Message, ReorderBuffer};
use crate::runtime::error::RuntimeError;
use crate::runtime::guid::Guid;

fn satisfy(n: u64) -> Message {
    Message::Satisfy {
        event: Guid::from_raw(n),
        payload: Guid::NULL,
        slot: 0,
    }
}

fn sequenced(
    from: usize,
    seq: u64,
) -> Envelope {
    Envelope {
        from,
        to: 0,
        seq: Some(seq),
        message: satisfy(seq),
    }
}

#[cfg(test)]
mod fabric_tests {
    use super::*;

    #[test]
    fn test_send_and_receive() {
        let fabric = Fabric::new(2, CommConfig::default());
        let rx = fabric.take_receiver(1).unwrap();
        assert!(fabric.take_receiver(1).is_none());

        fabric.send(0, 1, satisfy(5)).unwrap();
        assert_eq!(fabric.in_flight(), 1);

        let envelope = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(envelope.from, 0);
        assert_eq!(envelope.seq, None);
        assert_eq!(envelope.message, satisfy(5));
        fabric.complete();
        assert_eq!(fabric.in_flight(), 0);
        assert_eq!(fabric.stats().delivered, 1);
    }

    #[test]
    fn test_sequence_numbers_per_pair() {
        let config = CommConfig {
            sequenced: true,
            ..CommConfig::default()
        };
        let fabric = Fabric::new(3, config);
        let rx = fabric.take_receiver(2).unwrap();
        fabric.send(0, 2, satisfy(1)).unwrap();
        fabric.send(0, 2, satisfy(2)).unwrap();
        fabric.send(1, 2, satisfy(3)).unwrap();

        let seqs: Vec<_> = rx.try_iter().map(|e| (e.from, e.seq)).collect();
        assert_eq!(seqs, vec![(0, Some(0)), (0, Some(1)), (1, Some(0))]);
    }

    #[test]
    fn test_reorder_window_holds_until_full_or_flushed() {
        let config = CommConfig {
            reorder_window: 3,
            ..CommConfig::default()
        };
        let fabric = Fabric::new(2, config);
        let rx = fabric.take_receiver(1).unwrap();

        fabric.send(0, 1, satisfy(1)).unwrap();
        fabric.send(0, 1, satisfy(2)).unwrap();
        assert!(rx.try_recv().is_err());
        fabric.send(0, 1, satisfy(3)).unwrap();
        assert_eq!(rx.try_iter().count(), 3);

        fabric.send(0, 1, satisfy(4)).unwrap();
        assert!(rx.try_recv().is_err());
        fabric.flush(1);
        assert_eq!(rx.try_recv().unwrap().message, satisfy(4));
        assert_eq!(fabric.in_flight(), 4);
    }

    #[test]
    fn test_disconnect_fails_sends_and_notifies_peers() {
        let fabric = Fabric::new(3, CommConfig::default());
        let rx0 = fabric.take_receiver(0).unwrap();
        let rx2 = fabric.take_receiver(2).unwrap();

        fabric.disconnect(1);
        assert!(!fabric.is_alive(1));
        assert!(matches!(
            fabric.send(0, 1, satisfy(1)),
            Err(RuntimeError::RemoteUnreachable { domain: 1, .. })
        ));
        assert!(fabric.send(1, 0, satisfy(1)).is_err());

        for rx in [&rx0, &rx2] {
            assert_eq!(rx.try_recv().unwrap().message, Message::PeerLost { domain: 1 });
        }
        // Disconnecting twice is a no-op.
        fabric.disconnect(1);
        assert!(rx0.try_recv().is_err());
    }

    #[test]
    fn test_send_to_unknown_domain() {
        let fabric = Fabric::new(1, CommConfig::default());
        assert!(matches!(
            fabric.send(0, 4, satisfy(1)),
            Err(RuntimeError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_messages_serialize() {
        let envelope = Envelope {
            from: 1,
            to: 0,
            seq: Some(9),
            message: Message::CloneResponse {
                ticket: 4,
                datablock: Guid::from_raw(0x42),
                bytes: Some(vec![1, 2, 3]),
            },
        };
        let json = serde_json::to_string(&envelope).unwrap();
        let back: Envelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back, envelope);
        assert_eq!(back.message.name(), "CloneResponse");
    }
}

#[cfg(test)]
mod reorder_tests {
    use super::*;

    #[test]
    fn test_releases_in_order() {
        let mut buffer = ReorderBuffer::new();
        assert!(buffer.accept(sequenced(1, 2)).is_empty());
        assert!(buffer.accept(sequenced(1, 1)).is_empty());
        assert_eq!(buffer.held(), 2);

        let ready: Vec<_> = buffer
            .accept(sequenced(1, 0))
            .into_iter()
            .map(|e| e.seq)
            .collect();
        assert_eq!(ready, vec![Some(0), Some(1), Some(2)]);
        assert_eq!(buffer.held(), 0);
    }

    #[test]
    fn test_senders_are_independent() {
        let mut buffer = ReorderBuffer::new();
        assert!(buffer.accept(sequenced(1, 1)).is_empty());
        assert_eq!(buffer.accept(sequenced(2, 0)).len(), 1);
        assert_eq!(buffer.accept(sequenced(1, 0)).len(), 2);
    }

    #[test]
    fn test_unsequenced_pass_through_and_duplicates_drop() {
        let mut buffer = ReorderBuffer::new();
        let plain = Envelope {
            from: 3,
            to: 0,
            seq: None,
            message: Message::Shutdown,
        };
        assert_eq!(buffer.accept(plain).len(), 1);

        assert_eq!(buffer.accept(sequenced(1, 0)).len(), 1);
        assert!(buffer.accept(sequenced(1, 0)).is_empty());
    }

    #[test]
    fn test_forget_returns_held() {
        let mut buffer = ReorderBuffer::new();
        buffer.accept(sequenced(1, 3));
        buffer.accept(sequenced(1, 5));
        assert_eq!(buffer.forget(1).len(), 2);
        assert_eq!(buffer.held(), 0);
    }
}
