//! TTL-gated metric activation.
//!
//! A metric with no activations is always active. Otherwise it is active
//! iff some activation window is open: immediate activations open on their
//! triggering event, on-boot activations arm and open at the next boot.
//! Deactivation matchers close the windows they are bound to. Activation
//! matcher firings are routed by the dispatcher before the event reaches
//! the metric, so an activating event can itself be recorded.

use crate::spec::ActivationType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Window {
    NotActive,
    Active { start_ns: i64 },
    ArmedForBoot,
}

#[derive(Debug, Clone)]
pub struct Activation {
    pub matcher_id: i64,
    pub matcher_index: usize,
    pub deactivation_id: Option<i64>,
    pub deactivation_index: Option<usize>,
    pub ttl_ns: i64,
    pub activation_type: ActivationType,
    window: Window,
}

impl Activation {
    pub fn new(
        matcher_id: i64,
        matcher_index: usize,
        deactivation_id: Option<i64>,
        deactivation_index: Option<usize>,
        ttl_ns: i64,
        activation_type: ActivationType,
    ) -> Self {
        Self {
            matcher_id,
            matcher_index,
            deactivation_id,
            deactivation_index,
            ttl_ns,
            activation_type,
            window: Window::NotActive,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ActivationState {
    activations: Vec<Activation>,
}

impl ActivationState {
    pub fn new(activations: Vec<Activation>) -> Self {
        Self { activations }
    }

    pub fn is_empty(&self) -> bool {
        self.activations.is_empty()
    }

    pub fn activations(&self) -> &[Activation] {
        &self.activations
    }

    pub fn active(&self, now_ns: i64) -> bool {
        if self.activations.is_empty() {
            return true;
        }
        self.activations.iter().any(|a| match a.window {
            Window::Active { start_ns } => now_ns - start_ns < a.ttl_ns,
            _ => false,
        })
    }

    /// An activation matcher fired. Immediate windows (re)open; on-boot
    /// windows arm.
    pub fn on_activation_matcher(&mut self, matcher_index: usize, now_ns: i64) {
        for a in &mut self.activations {
            if a.matcher_index != matcher_index {
                continue;
            }
            match a.activation_type {
                ActivationType::Immediate => a.window = Window::Active { start_ns: now_ns },
                ActivationType::OnBoot => {
                    if !matches!(a.window, Window::Active { .. }) {
                        a.window = Window::ArmedForBoot;
                    }
                }
            }
        }
    }

    /// A deactivation matcher fired; cancel the windows bound to it.
    pub fn on_deactivation_matcher(&mut self, matcher_index: usize) {
        for a in &mut self.activations {
            if a.deactivation_index == Some(matcher_index) {
                a.window = Window::NotActive;
            }
        }
    }

    /// Boot: armed windows open now.
    pub fn on_boot(&mut self, now_ns: i64) {
        for a in &mut self.activations {
            if a.window == Window::ArmedForBoot {
                a.window = Window::Active { start_ns: now_ns };
            }
        }
    }

    /// Rewires matcher indices after a live update.
    pub fn rewire(&mut self, resolve: impl Fn(i64) -> Option<usize>) {
        for a in &mut self.activations {
            if let Some(idx) = resolve(a.matcher_id) {
                a.matcher_index = idx;
            }
            a.deactivation_index = a.deactivation_id.and_then(&resolve);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: i64 = 100;

    fn immediate(matcher_index: usize) -> Activation {
        Activation::new(1, matcher_index, None, None, TTL, ActivationType::Immediate)
    }

    #[test]
    fn test_no_activations_always_active() {
        let state = ActivationState::default();
        assert!(state.active(0));
        assert!(state.active(i64::MAX));
    }

    #[test]
    fn test_immediate_window_and_expiry() {
        let mut state = ActivationState::new(vec![immediate(3)]);
        assert!(!state.active(10));

        state.on_activation_matcher(3, 10);
        assert!(state.active(10));
        assert!(state.active(10 + TTL - 1));
        assert!(!state.active(10 + TTL));

        // Re-firing refreshes the window.
        state.on_activation_matcher(3, 200);
        assert!(state.active(200 + TTL - 1));
    }

    #[test]
    fn test_on_boot_arms_then_opens() {
        let mut state = ActivationState::new(vec![Activation::new(
            1,
            3,
            None,
            None,
            TTL,
            ActivationType::OnBoot,
        )]);
        state.on_activation_matcher(3, 10);
        assert!(!state.active(10));

        state.on_boot(50);
        assert!(state.active(50));
        assert!(!state.active(50 + TTL));
    }

    #[test]
    fn test_deactivation_cancels() {
        let mut state = ActivationState::new(vec![Activation::new(
            1,
            3,
            Some(2),
            Some(4),
            TTL,
            ActivationType::Immediate,
        )]);
        state.on_activation_matcher(3, 10);
        assert!(state.active(20));

        state.on_deactivation_matcher(4);
        assert!(!state.active(20));
    }

    #[test]
    fn test_rewire_updates_indices() {
        let mut state = ActivationState::new(vec![Activation::new(
            7,
            0,
            Some(8),
            Some(1),
            TTL,
            ActivationType::Immediate,
        )]);
        state.rewire(|id| match id {
            7 => Some(5),
            8 => Some(6),
            _ => None,
        });
        assert_eq!(state.activations()[0].matcher_index, 5);
        assert_eq!(state.activations()[0].deactivation_index, Some(6));
    }
}
