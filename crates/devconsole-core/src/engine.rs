// ── Decision engine contract ──

use crate::effect::Effect;
use crate::event::Event;
use crate::view::ViewModel;

/// The opaque decision engine the bridge drives.
///
/// `apply` must be synchronous and pure with respect to the state it
/// returns: same state + event, same result. All I/O happens outside,
/// requested through the returned effects. The bridge never inspects
/// `State`; it only projects it through [`view`](Self::view) after each
/// turn.
pub trait Engine: Send + Sync + 'static {
    type State: Clone + Send + Sync + 'static;

    /// The state before any event has been applied.
    fn initial(&self) -> Self::State;

    /// One turn: fold an event into the state, emitting follow-up
    /// effects. Effects are executed in the order returned.
    fn apply(&self, state: &Self::State, event: &Event) -> (Self::State, Vec<Effect>);

    /// Project the state into the rendering snapshot.
    fn view(&self, state: &Self::State) -> ViewModel;
}
