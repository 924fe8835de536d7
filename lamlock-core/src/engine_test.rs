#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use crate::chooser::ScriptedChooser;
    use crate::engine::{EngineConfig, MutexEngine, Phase, Step};
    use crate::error::EngineError;
    use crate::types::{
        Access, AccessOutcome, Envelope, LogicalTime, Message, MessageKind, Mutation, PeerId,
        RequestStamp, Role,
    };

    // =========================================================================
    // Helpers
    // =========================================================================

    fn peer(id: u32) -> PeerId {
        PeerId::new(id)
    }

    fn engine(me: u32, peers: u32, role: Role) -> MutexEngine {
        MutexEngine::new(EngineConfig::new(me, peers, role).unwrap())
    }

    fn scripted(me: u32, peers: u32, role: Role, chooser: ScriptedChooser) -> MutexEngine {
        MutexEngine::with_chooser(EngineConfig::new(me, peers, role).unwrap(), Box::new(chooser))
    }

    fn acks(step: &Step) -> Vec<(PeerId, LogicalTime)> {
        step.outbound
            .iter()
            .filter_map(|e| match e.message.kind {
                MessageKind::Ack { clock } => Some((e.to, clock)),
                _ => None,
            })
            .collect()
    }

    fn requests(step: &Step) -> Vec<(PeerId, LogicalTime)> {
        step.outbound
            .iter()
            .filter_map(|e| match e.message.kind {
                MessageKind::Request { clock } => Some((e.to, clock)),
                _ => None,
            })
            .collect()
    }

    fn labels(step: &Step) -> Vec<&'static str> {
        step.outbound.iter().map(|e| e.message.label()).collect()
    }

    /// Deliver everything in flight, FIFO, until the group is quiet.
    /// Returns every critical-section entry in order.
    fn settle(
        engines: &mut [MutexEngine],
        initial: Vec<Envelope>,
    ) -> Vec<(PeerId, AccessOutcome)> {
        let mut in_flight: VecDeque<Envelope> = initial.into();
        let mut entries = Vec::new();
        while let Some(envelope) = in_flight.pop_front() {
            let target = &mut engines[envelope.to.get() as usize - 1];
            let step = target.handle_message(envelope.message);
            if let Some(outcome) = step.entered {
                entries.push((envelope.to, outcome));
            }
            in_flight.extend(step.outbound);
        }
        entries
    }

    // =========================================================================
    // Requesting
    // =========================================================================

    #[test]
    fn request_goes_to_every_other_peer() {
        let mut e = engine(2, 4, Role::ReadOnly);
        let step = e.request_entry().unwrap();

        assert_eq!(requests(&step), vec![(peer(1), 1), (peer(3), 1), (peer(4), 1)]);
        assert!(step.outbound.iter().all(|env| env.message.sender == peer(2)));
        assert_eq!(e.phase(), Phase::Requesting);
        assert_eq!(e.request_stamp(), Some(RequestStamp::new(1, peer(2))));
        assert!(e.is_requesting());
        assert!(!e.is_using_resource());
    }

    #[test]
    fn second_request_is_rejected_without_side_effects() {
        let mut e = engine(1, 3, Role::ReadOnly);
        e.request_entry().unwrap();
        let before = e.status();

        assert_eq!(e.request_entry(), Err(EngineError::AlreadyRequesting));
        assert_eq!(e.status(), before);
    }

    #[test]
    fn request_while_holding_is_rejected() {
        let mut e = engine(1, 1, Role::ReadOnly);
        e.request_entry().unwrap();
        assert_eq!(e.request_entry(), Err(EngineError::AlreadyInCriticalSection));
    }

    #[test]
    fn single_peer_enters_immediately() {
        let mut e = scripted(1, 1, Role::ReadOnly, ScriptedChooser::new().with_reads([2]));
        let step = e.request_entry().unwrap();

        assert!(step.outbound.is_empty());
        assert_eq!(step.entered, Some(AccessOutcome::Read { position: 2, value: 3 }));
        assert!(e.is_using_resource());
    }

    #[test]
    fn failed_immediate_entry_leaves_peer_idle() {
        let mut e = scripted(1, 1, Role::ReadOnly, ScriptedChooser::new().with_reads([99]));
        let before = e.status();

        assert!(matches!(e.request_entry(), Err(EngineError::Resource(_))));
        assert_eq!(e.phase(), Phase::Idle);
        assert_eq!(e.request_stamp(), None);
        assert_eq!(e.status(), before);

        // The next round is not blocked
        let step = e.request_entry().unwrap();
        assert_eq!(step.entered, Some(AccessOutcome::Read { position: 0, value: 1 }));
    }

    #[test]
    fn superseded_local_write_is_refused() {
        let mut e = scripted(
            1,
            1,
            Role::ReadWrite,
            ScriptedChooser::new().with_writes([(0, 9)]),
        );
        e.resource_mut()
            .write(0, 5, RequestStamp::new(100, peer(2)))
            .unwrap();

        assert_eq!(
            e.request_entry(),
            Err(EngineError::WriteSuperseded { position: 0 })
        );
        assert_eq!(e.resource().read(0), Ok(5));
        assert_eq!(e.phase(), Phase::Idle);
    }

    #[test]
    fn superseded_write_after_grants_cancels_the_request() {
        let mut e = scripted(
            1,
            2,
            Role::ReadWrite,
            ScriptedChooser::new().with_writes([(3, 9)]),
        );
        e.resource_mut()
            .write(3, 5, RequestStamp::new(100, peer(2)))
            .unwrap();
        e.request_entry().unwrap();

        let step = e.handle_ack(peer(2), 1);
        assert_eq!(step.entered, None);
        assert_eq!(e.phase(), Phase::Idle);
        assert_eq!(e.resource().read(3), Ok(5));
    }

    // =========================================================================
    // Grants
    // =========================================================================

    #[test]
    fn enters_after_all_acks_in_any_order() {
        for order in [[2, 3, 4], [4, 2, 3], [3, 4, 2]] {
            let mut e = scripted(1, 4, Role::ReadOnly, ScriptedChooser::new().with_reads([5]));
            e.request_entry().unwrap();

            for (i, from) in order.iter().enumerate() {
                let step = e.handle_ack(peer(*from), 1);
                if i + 1 < order.len() {
                    assert_eq!(step.entered, None, "entered early with order {:?}", order);
                } else {
                    assert_eq!(step.entered, Some(AccessOutcome::Read { position: 5, value: 6 }));
                }
            }
            assert_eq!(e.phase(), Phase::InCriticalSection);
            assert_eq!(e.ack_count(), 3);
        }
    }

    #[test]
    fn duplicate_ack_counts_once() {
        let mut e = engine(1, 3, Role::ReadOnly);
        e.request_entry().unwrap();
        e.handle_ack(peer(2), 1);
        let step = e.handle_ack(peer(2), 1);

        assert_eq!(step, Step::default());
        assert_eq!(e.ack_count(), 1);
        assert_eq!(e.phase(), Phase::Requesting);
    }

    #[test]
    fn stale_ack_is_ignored() {
        let mut e = engine(1, 3, Role::ReadOnly);
        e.request_entry().unwrap();
        e.rebroadcast_request().unwrap();
        let current = e.request_stamp().unwrap().clock;
        assert_ne!(current, 1);

        e.handle_ack(peer(2), 1);
        assert_eq!(e.ack_count(), 0);

        e.handle_ack(peer(2), current);
        let step = e.handle_ack(peer(3), current);
        assert!(step.entered.is_some());
    }

    #[test]
    fn ack_while_idle_is_ignored() {
        let mut e = engine(1, 3, Role::ReadOnly);
        assert_eq!(e.handle_ack(peer(2), 1), Step::default());
        assert_eq!(e.ack_count(), 0);
        assert_eq!(e.phase(), Phase::Idle);
    }

    #[test]
    fn entering_requires_every_grant() {
        let mut e = engine(1, 3, Role::ReadOnly);
        assert_eq!(
            e.enter_critical_section(Access::Read),
            Err(EngineError::NotRequesting)
        );

        e.request_entry().unwrap();
        e.handle_ack(peer(3), 1);
        assert_eq!(
            e.enter_critical_section(Access::Read),
            Err(EngineError::GrantsOutstanding { received: 1, needed: 2 })
        );
        assert_eq!(e.phase(), Phase::Requesting);
    }

    // =========================================================================
    // Inbound requests
    // =========================================================================

    #[test]
    fn idle_peer_grants_and_echoes_clock() {
        let mut e = engine(2, 3, Role::ReadOnly);
        let step = e.handle_request(peer(1), 5);

        assert_eq!(acks(&step), vec![(peer(1), 5)]);
        assert_eq!(step.outbound[0].message.sender, peer(2));
        assert_eq!(e.clock(), 6);
        assert!(e.deferred().is_empty());
    }

    #[test]
    fn equal_clocks_lower_peer_wins() {
        let mut two = engine(2, 3, Role::ReadOnly);
        let mut three = engine(3, 3, Role::ReadOnly);
        two.request_entry().unwrap();
        three.request_entry().unwrap();

        let from_three = two.handle_request(peer(3), 1);
        let from_two = three.handle_request(peer(2), 1);

        assert!(acks(&from_three).is_empty());
        assert!(two.deferred().contains(peer(3)));
        assert_eq!(acks(&from_two), vec![(peer(2), 1)]);
        assert!(three.deferred().is_empty());
    }

    #[test]
    fn own_later_request_grants_earlier_incoming() {
        let mut e = engine(1, 3, Role::ReadOnly);
        // Push our clock ahead so our own request loses
        e.handle_request(peer(2), 9);
        let ack = e.handle_request(peer(3), 1);
        assert_eq!(acks(&ack), vec![(peer(3), 1)]);
        e.request_entry().unwrap();

        let step = e.handle_request(peer(3), 4);
        assert_eq!(acks(&step), vec![(peer(3), 4)]);
    }

    #[test]
    fn messages_from_self_or_outsiders_are_dropped() {
        let mut e = engine(1, 3, Role::ReadOnly);
        let before = e.status();

        assert_eq!(e.handle_message(Message::request(peer(1), 4)), Step::default());
        assert_eq!(e.handle_message(Message::request(peer(7), 4)), Step::default());
        assert_eq!(e.handle_message(Message::ack(peer(0), 4)), Step::default());
        assert_eq!(e.status(), before);
    }

    #[test]
    fn ack_and_update_leave_the_clock_alone() {
        let mut e = engine(1, 3, Role::ReadOnly);
        e.request_entry().unwrap();
        e.handle_ack(peer(2), 1);
        e.handle_update(peer(3), 0, 10, 40);
        assert_eq!(e.clock(), 1);
    }

    // =========================================================================
    // Release
    // =========================================================================

    #[test]
    fn release_acks_each_deferred_request_exactly_once() {
        let mut e = engine(1, 4, Role::ReadOnly);
        e.request_entry().unwrap();

        e.handle_request(peer(2), 1);
        e.handle_request(peer(3), 2);
        // A newer request from 3 replaces its queued clock
        e.handle_request(peer(3), 4);
        for from in [2, 3, 4] {
            e.handle_ack(peer(from), 1);
        }
        assert!(e.is_using_resource());
        e.handle_request(peer(4), 3);
        assert_eq!(e.deferred().len(), 3);

        let step = e.release_critical_section(None).unwrap();
        assert_eq!(acks(&step), vec![(peer(2), 1), (peer(3), 4), (peer(4), 3)]);
        assert!(e.deferred().is_empty());
        assert_eq!(e.phase(), Phase::Idle);
        assert_eq!(e.request_stamp(), None);
        assert_eq!(e.ack_count(), 0);
    }

    #[test]
    fn release_sends_update_before_grants() {
        let mut e = scripted(
            1,
            3,
            Role::ReadWrite,
            ScriptedChooser::new().with_writes([(2, 42)]),
        );
        e.request_entry().unwrap();
        e.handle_request(peer(2), 1);
        e.handle_ack(peer(2), 1);
        let step = e.handle_ack(peer(3), 1);

        let mutation = Mutation {
            position: 2,
            value: 42,
            stamp: RequestStamp::new(1, peer(1)),
        };
        assert_eq!(step.entered, Some(AccessOutcome::Write(mutation)));
        assert_eq!(e.resource().read(2), Ok(42));

        let step = e.release_critical_section(Some(mutation)).unwrap();
        assert_eq!(labels(&step), vec!["UPDATE", "UPDATE", "ACK"]);
        assert_eq!(step.outbound[0].to, peer(2));
        assert_eq!(step.outbound[1].to, peer(3));
        assert_eq!(
            step.outbound[0].message.kind,
            MessageKind::Update { position: 2, value: 42, clock: 1 }
        );
    }

    #[test]
    fn release_outside_critical_section_fails() {
        let mut e = engine(1, 3, Role::ReadOnly);
        assert_eq!(
            e.release_critical_section(None),
            Err(EngineError::NotInCriticalSection)
        );
        e.request_entry().unwrap();
        assert_eq!(
            e.release_critical_section(None),
            Err(EngineError::NotInCriticalSection)
        );
    }

    #[test]
    fn peer_can_request_again_after_release() {
        let mut e = engine(1, 2, Role::ReadOnly);
        e.request_entry().unwrap();
        e.handle_ack(peer(2), 1);
        e.release_critical_section(None).unwrap();

        let step = e.request_entry().unwrap();
        assert_eq!(requests(&step), vec![(peer(2), 2)]);
        assert_eq!(e.ack_count(), 0);
    }

    // =========================================================================
    // Retry and cancel
    // =========================================================================

    #[test]
    fn rebroadcast_grants_requests_that_now_order_first() {
        let mut e = engine(1, 3, Role::ReadOnly);
        e.request_entry().unwrap();
        // (1,1) beats (1,2): deferred
        e.handle_request(peer(2), 1);
        assert!(e.deferred().contains(peer(2)));

        let step = e.rebroadcast_request().unwrap();
        let fresh = e.request_stamp().unwrap();
        assert!(RequestStamp::new(1, peer(2)).precedes(&fresh));

        assert_eq!(labels(&step), vec!["ACK", "REQUEST", "REQUEST"]);
        assert_eq!(acks(&step), vec![(peer(2), 1)]);
        assert_eq!(requests(&step), vec![(peer(2), fresh.clock), (peer(3), fresh.clock)]);
        assert!(e.deferred().is_empty());
    }

    #[test]
    fn rebroadcast_clears_grants_for_the_old_clock() {
        let mut e = engine(1, 3, Role::ReadOnly);
        e.request_entry().unwrap();
        e.handle_ack(peer(2), 1);
        assert_eq!(e.ack_count(), 1);

        e.rebroadcast_request().unwrap();
        assert_eq!(e.ack_count(), 0);
        assert_eq!(e.phase(), Phase::Requesting);
    }

    #[test]
    fn rebroadcast_needs_an_outstanding_request() {
        let mut e = engine(1, 3, Role::ReadOnly);
        assert_eq!(e.rebroadcast_request(), Err(EngineError::NotRequesting));
    }

    #[test]
    fn cancel_releases_everyone_deferred() {
        let mut e = engine(1, 3, Role::ReadOnly);
        e.request_entry().unwrap();
        e.handle_request(peer(3), 1);
        e.handle_ack(peer(2), 1);

        let step = e.cancel_request().unwrap();
        assert_eq!(acks(&step), vec![(peer(3), 1)]);
        assert_eq!(e.phase(), Phase::Idle);

        // The grant that arrives afterwards changes nothing
        assert_eq!(e.handle_ack(peer(3), 1), Step::default());
        assert_eq!(e.cancel_request(), Err(EngineError::NotRequesting));
    }

    // =========================================================================
    // Updates
    // =========================================================================

    #[test]
    fn update_while_requesting_is_applied() {
        let mut e = engine(2, 3, Role::ReadOnly);
        e.request_entry().unwrap();
        e.handle_ack(peer(3), 1);

        let step = e.handle_update(peer(1), 3, 77, 1);
        assert_eq!(
            step.applied,
            Some(Mutation {
                position: 3,
                value: 77,
                stamp: RequestStamp::new(1, peer(1)),
            })
        );
        assert!(step.outbound.is_empty());
        assert_eq!(e.resource().read(3), Ok(77));
        assert_eq!(e.phase(), Phase::Requesting);
        assert_eq!(e.ack_count(), 1);
    }

    #[test]
    fn out_of_range_update_is_dropped() {
        let mut e = engine(2, 3, Role::ReadOnly);
        let step = e.handle_update(peer(1), 99, 5, 1);
        assert_eq!(step, Step::default());
        assert_eq!(e.resource().snapshot(), vec![1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn reader_unblocked_by_writer_sees_the_write() {
        let mut engines = vec![
            scripted(1, 2, Role::ReadWrite, ScriptedChooser::new().with_writes([(4, 55)])),
            scripted(2, 2, Role::ReadOnly, ScriptedChooser::new().with_reads([4])),
        ];

        // Writer takes the section first
        let step = engines[0].request_entry().unwrap();
        let entries = settle(&mut engines, step.outbound);
        let (_, writer) = entries[0];
        assert_eq!(engines[0].phase(), Phase::InCriticalSection);

        // The reader asks while the writer holds it and is deferred
        let step = engines[1].request_entry().unwrap();
        assert!(settle(&mut engines, step.outbound).is_empty());
        assert_eq!(engines[0].deferred().len(), 1);

        // UPDATE travels ahead of the ACK on the same link
        let step = engines[0].release_critical_section(writer.mutation()).unwrap();
        let entries = settle(&mut engines, step.outbound);
        assert_eq!(
            entries,
            vec![(peer(2), AccessOutcome::Read { position: 4, value: 55 })]
        );
        assert_eq!(engines[0].resource(), engines[1].resource());
    }

    #[test]
    fn status_serializes_for_logs() {
        let mut e = engine(1, 3, Role::ReadWrite);
        e.request_entry().unwrap();
        e.handle_request(peer(2), 1);

        let status = e.status();
        assert_eq!(status.request, Some(RequestStamp::new(1, peer(1))));
        assert_eq!(status.deferred.len(), 1);

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["role"], "read-write");
        assert_eq!(json["peer"], 1);
        assert_eq!(json["phase"], "Requesting");
    }
}
