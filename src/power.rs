use embassy_futures::yield_now;
use embassy_time::{with_timeout, Duration, Timer};

use crate::{
    InterruptSource, ProtocolEngine, ProtocolError, ProtocolResult, ResponseBuffers, Transport,
};

/// The opcode of the event, which the NWP sends once it finished booting.
pub const INIT_COMPLETE_OPCODE: u16 = 0x0008;

/// The power and wake registers of the NWP.
///
/// These are board specific, so the engine only drives them in the right order.
pub trait PowerControl {
    /// Release the NWP from reset.
    fn clear_stop(&mut self);
    /// Hold the NWP in reset.
    fn set_stop(&mut self);
    /// Acknowledge a stale interrupt from a previous power cycle.
    fn ack_host_interrupt(&mut self);
    fn request_wake(&mut self);
    /// Ask the NWP to prepare for shutdown.
    fn trigger_oob_interrupt(&mut self);
    fn oob_acknowledged(&mut self) -> bool;
    fn clear_oob_ack(&mut self);
    /// Check if the wake configuration reached the quiesced value.
    fn is_quiesced(&mut self) -> bool;
    /// Switch the regulator of the NWP into its low power mode.
    fn enter_low_power(&mut self);
}

/// Yield until `condition` holds, for at most `timeout`.
async fn poll_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> ProtocolResult<()> {
    with_timeout(timeout, async {
        while !condition() {
            yield_now().await;
        }
    })
    .await
    .map_err(|_| ProtocolError::PowerSequenceTimeout)
}

impl<T: Transport, I: InterruptSource> ProtocolEngine<T, I> {
    /// Power up the NWP and wait until it reports, that it's ready.
    ///
    /// The request for the init complete event is registered, before the NWP is released from
    /// reset, so the event can't be missed.
    pub async fn power_on<P: PowerControl>(&self, control: &mut P) -> ProtocolResult<()> {
        let mut status = [0u8; 4];
        let registration = self
            .register(ResponseBuffers::new(INIT_COMPLETE_OPCODE, &mut status))
            .await?;

        trace!("Releasing NWP from reset.");
        control.clear_stop();
        trace!("Acknowledging stale host interrupt.");
        control.ack_host_interrupt();
        trace!("Requesting wake.");
        control.request_wake();
        self.set_irq_enabled(true);

        let res = self
            .wait_for_response(&registration, self.config().init_timeout)
            .await
            .map_err(|err| match err {
                ProtocolError::ResponseTimeout => ProtocolError::PowerSequenceTimeout,
                err => err,
            });
        drop(registration);
        res?;

        info!(
            "NWP is up, init status: {:x}",
            u32::from_le_bytes(status)
        );
        Ok(())
    }
    /// Shut the NWP down.
    ///
    /// Every register poll is bounded by the power poll timeout. If one expires, the NWP is left
    /// running and [ProtocolError::PowerSequenceTimeout] is returned.
    pub async fn power_off<P: PowerControl>(&self, control: &mut P) -> ProtocolResult<()> {
        let timeout = self.config().power_poll_timeout;

        trace!("Triggering out of band interrupt.");
        control.trigger_oob_interrupt();
        if let Err(err) = poll_until(timeout, || control.oob_acknowledged()).await {
            warn!("NWP didn't acknowledge the shutdown request.");
            return Err(err);
        }
        if let Err(err) = poll_until(timeout, || control.is_quiesced()).await {
            warn!("NWP didn't quiesce.");
            return Err(err);
        }
        control.clear_oob_ack();

        self.set_irq_enabled(false);
        trace!("Entering low power mode.");
        control.enter_low_power();
        trace!("Stopping NWP.");
        control.set_stop();
        Timer::after(self.config().power_off_settle).await;
        debug!("NWP powered off.");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, rc::Rc};

    use embassy_futures::{block_on, join::join};

    use super::*;
    use crate::{
        test_util::{response_frame, MockIrq, ScriptedTransport},
        EngineConfig,
    };

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    enum Step {
        ClearStop,
        SetStop,
        AckHostInterrupt,
        RequestWake,
        TriggerOob,
        PollOobAck,
        ClearOobAck,
        PollQuiesced,
        EnterLowPower,
    }
    #[derive(Default)]
    struct RecordingControl {
        steps: Rc<RefCell<Vec<Step>>>,
        /// Number of polls, before the register reads as set.
        oob_ack_after: usize,
        quiesced: bool,
    }
    impl RecordingControl {
        fn record(&self, step: Step) {
            self.steps.borrow_mut().push(step);
        }
        fn polls(&self, step: Step) -> usize {
            self.steps.borrow().iter().filter(|s| **s == step).count()
        }
        fn sequence(&self) -> Vec<Step> {
            let mut steps = self.steps.borrow().clone();
            steps.dedup();
            steps
        }
    }
    impl PowerControl for RecordingControl {
        fn clear_stop(&mut self) {
            self.record(Step::ClearStop);
        }
        fn set_stop(&mut self) {
            self.record(Step::SetStop);
        }
        fn ack_host_interrupt(&mut self) {
            self.record(Step::AckHostInterrupt);
        }
        fn request_wake(&mut self) {
            self.record(Step::RequestWake);
        }
        fn trigger_oob_interrupt(&mut self) {
            self.record(Step::TriggerOob);
        }
        fn oob_acknowledged(&mut self) -> bool {
            self.record(Step::PollOobAck);
            self.polls(Step::PollOobAck) > self.oob_ack_after
        }
        fn clear_oob_ack(&mut self) {
            self.record(Step::ClearOobAck);
        }
        fn is_quiesced(&mut self) -> bool {
            self.record(Step::PollQuiesced);
            self.quiesced
        }
        fn enter_low_power(&mut self) {
            self.record(Step::EnterLowPower);
        }
    }

    fn engine(
        config: EngineConfig,
    ) -> (
        ProtocolEngine<ScriptedTransport, MockIrq>,
        ScriptedTransport,
        MockIrq,
    ) {
        let transport = ScriptedTransport::new();
        let irq = MockIrq::new();
        (
            ProtocolEngine::new(transport.clone(), irq.clone(), config),
            transport,
            irq,
        )
    }

    #[test]
    fn power_on_waits_for_init_complete() {
        let (engine, transport, irq) = engine(EngineConfig::default());
        transport.push_rx(&response_frame(INIT_COMPLETE_OPCODE, &[0x01, 0x00, 0x00, 0x80]));
        let mut control = RecordingControl::default();

        let (res, handled) = block_on(join(engine.power_on(&mut control), async {
            yield_now().await;
            assert!(irq.state().enabled);
            assert_eq!(engine.pending_requests(), 1);
            engine.on_nwp_irq()
        }));

        assert_eq!(res, Ok(()));
        assert_eq!(handled, Ok(INIT_COMPLETE_OPCODE));
        assert_eq!(
            control.sequence(),
            [Step::ClearStop, Step::AckHostInterrupt, Step::RequestWake]
        );
        assert_eq!(engine.pending_requests(), 0);
        // Power on never writes a command.
        assert_eq!(transport.written(), crate::H2N_CNYS_PATTERN.to_wire());
    }

    #[test]
    fn power_on_times_out_without_init_complete() {
        let (engine, _, _) = engine(EngineConfig {
            init_timeout: Duration::from_millis(10),
            ..Default::default()
        });
        let mut control = RecordingControl::default();

        assert_eq!(
            block_on(engine.power_on(&mut control)),
            Err(ProtocolError::PowerSequenceTimeout)
        );
        assert_eq!(engine.pending_requests(), 0);
    }

    #[test]
    fn power_off_sequence() {
        let (engine, _, irq) = engine(EngineConfig::default());
        let mut control = RecordingControl {
            oob_ack_after: 3,
            quiesced: true,
            ..Default::default()
        };

        assert_eq!(block_on(engine.power_off(&mut control)), Ok(()));
        assert_eq!(control.polls(Step::PollOobAck), 4);
        assert_eq!(
            control.sequence(),
            [
                Step::TriggerOob,
                Step::PollOobAck,
                Step::PollQuiesced,
                Step::ClearOobAck,
                Step::EnterLowPower,
                Step::SetStop
            ]
        );
        let irq = irq.state();
        assert!(!irq.enabled);
        assert_eq!(irq.disables, 1);
    }

    #[test]
    fn power_off_gives_up_on_a_stuck_register() {
        let (engine, _, irq) = engine(EngineConfig {
            power_poll_timeout: Duration::from_millis(5),
            ..Default::default()
        });
        let mut control = RecordingControl {
            quiesced: false,
            ..Default::default()
        };

        assert_eq!(
            block_on(engine.power_off(&mut control)),
            Err(ProtocolError::PowerSequenceTimeout)
        );
        assert!(control.polls(Step::PollQuiesced) > 0);
        assert!(!control.sequence().contains(&Step::SetStop));
        assert_eq!(irq.state().disables, 0);
    }
}
