//! Bounds the number of new packets a daemon injects per token visit.

use crate::constants::{DEFAULT_PERSONAL_WINDOW, DEFAULT_WINDOW};

#[derive(Debug, Clone)]
pub struct FlowControl {
    /// Ring-wide budget of new packets per token rotation
    window: i32,
    /// Budget of new packets for this daemon per token visit
    personal_window: i32,
    /// Retransmissions this daemon counted into the token on its previous visit
    last_num_retrans: i32,
    /// New packets this daemon counted into the token on its previous visit
    last_num_sent: i32,
}

impl Default for FlowControl {
    fn default() -> Self {
        FlowControl::new(DEFAULT_WINDOW, DEFAULT_PERSONAL_WINDOW)
    }
}

impl FlowControl {
    pub fn new(window: i32, personal_window: i32) -> Self {
        FlowControl { window, personal_window, last_num_retrans: 0, last_num_sent: 0 }
    }

    pub fn window(&self) -> i32 {
        self.window
    }

    pub fn personal_window(&self) -> i32 {
        self.personal_window
    }

    /// New packets allowed on this visit, given the token's counter and the retransmissions
    /// already made during the visit.
    pub fn allowed(&self, flow_control: i16, num_retrans: usize) -> usize {
        let budget = self.window + self.personal_window - flow_control as i32 - num_retrans as i32;
        let cap = self.window.min(self.personal_window).max(0);
        budget.max(0).min(cap) as usize
    }

    /// Replaces this daemon's contribution from its previous visit with the current one and
    /// returns the new token counter.
    pub fn update_counter(&mut self, flow_control: i16, num_retrans: usize, num_sent: usize) -> i16 {
        let retrans = num_retrans as i32;
        let sent = num_sent as i32;
        let counter = flow_control as i32 - self.last_num_retrans - self.last_num_sent + retrans + sent;
        self.last_num_retrans = retrans;
        self.last_num_sent = sent;
        counter.max(i16::MIN as i32).min(i16::MAX as i32) as i16
    }

    /// Forgets the previous visit; the token of a new ring starts from zero.
    pub fn new_configuration(&mut self) {
        self.last_num_retrans = 0;
        self.last_num_sent = 0;
    }
}
