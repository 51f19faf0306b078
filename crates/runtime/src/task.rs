//! Concurrency runtime seam
//!
//! The VM maintains no scheduler. The concurrency opcodes delegate to a
//! [`TaskRuntime`], so any M:N runtime can plug in behind the trait.
//! [`NullRuntime`] is the single-threaded default: task contexts are
//! plain field buffers, channels are in-process queues, and
//! `scheduler_run` is a no-op because the core runs task blocks inline.

use crate::value::Value;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

pub trait TaskRuntime {
    fn task_context_alloc(&self, fields: usize) -> Value;
    fn task_context_init(&self, context: &Value);
    fn task_set_field(&self, context: &Value, index: usize, value: Value);
    fn task_get_field(&self, context: &Value, index: usize) -> Value;
    fn channel_alloc(&self) -> Value;
    fn channel_push(&self, channel: &Value, value: Value);
    fn channel_pop(&self, channel: &Value) -> Value;
    fn channel_has_data(&self, channel: &Value) -> bool;
    fn scheduler_run(&self, context: &Value);
}

/// Inert single-threaded implementation used by the core
#[derive(Debug, Default)]
pub struct NullRuntime {
    channels: RefCell<Vec<Rc<RefCell<VecDeque<Value>>>>>,
}

impl NullRuntime {
    pub fn new() -> Self {
        NullRuntime::default()
    }

    fn queue_of(&self, channel: &Value) -> Option<Rc<RefCell<VecDeque<Value>>>> {
        match channel {
            Value::Int(id) => self.channels.borrow().get(*id as usize).cloned(),
            _ => None,
        }
    }
}

impl TaskRuntime for NullRuntime {
    fn task_context_alloc(&self, fields: usize) -> Value {
        Value::list(vec![Value::Null; fields])
    }

    fn task_context_init(&self, _context: &Value) {}

    fn task_set_field(&self, context: &Value, index: usize, value: Value) {
        if let Value::List(fields) = context {
            let mut fields = fields.borrow_mut();
            if index < fields.len() {
                fields[index] = value;
            }
        }
    }

    fn task_get_field(&self, context: &Value, index: usize) -> Value {
        match context {
            Value::List(fields) => fields.borrow().get(index).cloned().unwrap_or(Value::Null),
            _ => Value::Null,
        }
    }

    fn channel_alloc(&self) -> Value {
        let queue = Rc::new(RefCell::new(VecDeque::new()));
        let id = {
            let mut channels = self.channels.borrow_mut();
            channels.push(queue);
            channels.len() - 1
        };
        Value::Int(id as i64)
    }

    fn channel_push(&self, channel: &Value, value: Value) {
        if let Some(queue) = self.queue_of(channel) {
            queue.borrow_mut().push_back(value);
        }
    }

    fn channel_pop(&self, channel: &Value) -> Value {
        match self.queue_of(channel) {
            Some(queue) => queue.borrow_mut().pop_front().unwrap_or(Value::Null),
            None => Value::Null,
        }
    }

    fn channel_has_data(&self, channel: &Value) -> bool {
        self.queue_of(channel)
            .is_some_and(|queue| !queue.borrow().is_empty())
    }

    fn scheduler_run(&self, _context: &Value) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_context_fields() {
        let runtime = NullRuntime::new();
        let context = runtime.task_context_alloc(2);
        runtime.task_set_field(&context, 1, Value::Int(7));
        assert_eq!(runtime.task_get_field(&context, 1), Value::Int(7));
        assert_eq!(runtime.task_get_field(&context, 0), Value::Null);
    }

    #[test]
    fn test_channel_fifo() {
        let runtime = NullRuntime::new();
        let channel = runtime.channel_alloc();
        assert!(!runtime.channel_has_data(&channel));
        runtime.channel_push(&channel, Value::Int(1));
        runtime.channel_push(&channel, Value::Int(2));
        assert!(runtime.channel_has_data(&channel));
        assert_eq!(runtime.channel_pop(&channel), Value::Int(1));
        assert_eq!(runtime.channel_pop(&channel), Value::Int(2));
        assert_eq!(runtime.channel_pop(&channel), Value::Null);
    }
}
