use crate::types::{ExecutionId, VariableMap};

/// One step the engine performs on an execution
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    /// Enter the execution's current node and run its behavior
    ExecuteActivity {
        /// Execution to advance
        execution_id: ExecutionId,
        /// Run the behavior even if the node is marked asynchronous
        skip_async: bool,
    },
    /// Complete the execution's current node
    LeaveActivity {
        /// Execution leaving its node
        execution_id: ExecutionId,
    },
    /// Move along the given flows, forking when there are several
    TakeFlows {
        /// Execution carrying the token
        execution_id: ExecutionId,
        /// Flow ids, in definition order
        flow_ids: Vec<String>,
    },
    /// Destroy a token and propagate completion upwards
    EndExecution {
        /// Execution to end
        execution_id: ExecutionId,
    },
    /// Resume a waiting execution
    Trigger {
        /// Waiting execution
        execution_id: ExecutionId,
        /// Signal or event name, if any
        signal: Option<String>,
        /// Variables delivered with the trigger
        payload: Option<VariableMap>,
    },
    /// Fire a boundary event attached to the activity of a scope execution
    FireBoundaryEvent {
        /// Activity scope execution the event is attached to
        scope_execution_id: ExecutionId,
        /// Boundary event node id
        boundary_id: String,
        /// Variables delivered with the event
        payload: Option<VariableMap>,
    },
    /// Throw a BPMN error from an execution
    PropagateError {
        /// Throwing execution
        execution_id: ExecutionId,
        /// Error code
        error_code: String,
    },
}

/// LIFO stack of pending operations within one unit of work
#[derive(Debug, Default)]
pub struct Agenda {
    operations: Vec<Operation>,
}

impl Agenda {
    /// Schedule an operation to run next
    pub fn push(&mut self, operation: Operation) {
        self.operations.push(operation);
    }

    /// Schedule operations so that they run in the given order
    pub fn push_all_in_order(&mut self, operations: Vec<Operation>) {
        self.operations.extend(operations.into_iter().rev());
    }

    /// Next operation to run
    pub fn pop(&mut self) -> Option<Operation> {
        self.operations.pop()
    }

    /// Pending operations
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    /// Whether nothing is pending
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}
