use uuid::Uuid;

use super::module::ModuleCommand;
use crate::error::StateError;
use crate::registry::VarContext;

/// A production order being driven step by step across modules.
///
/// `orderUpdateId` starts at 1 and only moves forward, one per command that
/// actually went out. A non-empty plan fixes which command each id carries.
#[derive(Debug, Clone)]
pub struct WorkflowOrder {
    order_id: String,
    steps: Vec<ModuleCommand>,
    context: VarContext,
    update_id: u64,
    aborted: bool,
}

impl WorkflowOrder {
    pub fn new(steps: Vec<ModuleCommand>, context: VarContext) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), steps, context)
    }

    pub fn with_id(order_id: impl Into<String>, steps: Vec<ModuleCommand>, context: VarContext) -> Self {
        let order_id = order_id.into();
        let mut context = context;
        context.set("order_id", order_id.clone());
        Self {
            order_id,
            steps,
            context,
            update_id: 0,
            aborted: false,
        }
    }

    pub fn order_id(&self) -> &str {
        &self.order_id
    }

    pub fn context(&self) -> &VarContext {
        &self.context
    }

    pub fn update_id(&self) -> u64 {
        self.update_id
    }

    /// The id the next command will carry, without consuming it.
    pub fn peek_next(&self) -> Result<u64, StateError> {
        if self.aborted {
            return Err(StateError::OrderAborted(self.order_id.clone()));
        }
        if !self.steps.is_empty() && self.update_id as usize >= self.steps.len() {
            return Err(StateError::WrongState {
                operation: "advance",
                state: format!("order {} complete", self.order_id),
            });
        }
        Ok(self.update_id + 1)
    }

    pub fn advance(&mut self) -> Result<u64, StateError> {
        let next = self.peek_next()?;
        self.update_id = next;
        Ok(next)
    }

    pub fn abort(&mut self) {
        self.aborted = true;
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    /// The planned step the next command fulfils, if a plan was given.
    pub fn current_step(&self) -> Option<ModuleCommand> {
        self.steps.get(self.update_id as usize).copied()
    }

    pub fn is_complete(&self) -> bool {
        !self.steps.is_empty() && self.update_id as usize >= self.steps.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_counts_from_one() {
        let mut order = WorkflowOrder::new(
            vec![ModuleCommand::Pick, ModuleCommand::Mill, ModuleCommand::Drop],
            VarContext::new(),
        );
        assert_eq!(order.current_step(), Some(ModuleCommand::Pick));
        assert_eq!(order.advance(), Ok(1));
        assert_eq!(order.advance(), Ok(2));
        assert_eq!(order.current_step(), Some(ModuleCommand::Drop));
        assert_eq!(order.advance(), Ok(3));
        assert!(order.is_complete());
        assert!(order.advance().is_err());
        assert_eq!(order.update_id(), 3);
    }

    #[test]
    fn aborted_order_refuses_to_advance() {
        let mut order = WorkflowOrder::with_id("abc", Vec::new(), VarContext::new());
        assert_eq!(order.context().get("order_id"), Some("abc"));
        order.advance().unwrap();
        order.abort();
        assert!(order.is_aborted());
        assert_eq!(order.advance(), Err(StateError::OrderAborted("abc".into())));
    }

    #[test]
    fn unplanned_orders_advance_freely() {
        let mut order = WorkflowOrder::new(Vec::new(), VarContext::new());
        for expected in 1..=10 {
            assert_eq!(order.advance(), Ok(expected));
        }
        assert_eq!(order.current_step(), None);
        assert_eq!(order.order_id().len(), 36);
    }
}
