//! Structured logging for SSH operations
//!
//! Thin helpers over `tracing` so every component logs the same event with
//! the same field names.
//!
//! # Log Levels
//!
//! - **DEBUG**: Packet, window and SFTP request traffic
//! - **INFO**: Transport state transitions, key exchange, channel lifecycle
//! - **WARN**: Recoverable protocol oddities
//! - **ERROR**: Fatal connection errors
//!
//! # Example
//!
//! ```no_run
//! use kestrel_proto::ssh::logging;
//!
//! tracing_subscriber::fmt()
//!     .with_env_filter("kestrel_proto::ssh=debug")
//!     .init();
//!
//! logging::log_state_transition("client", "KeyExchange", "Authenticated");
//! ```

use tracing::{debug, error, info, warn};

/// Log a transport state transition
pub fn log_state_transition(role: &str, old_state: &str, new_state: &str) {
    info!(
        role = role,
        state_from = old_state,
        state_to = new_state,
        "Transport state transition"
    );
}

/// Log the peer identification line
pub fn log_peer_identification(role: &str, identification: &str, banner_lines: usize) {
    info!(
        role = role,
        peer = identification,
        banner_lines = banner_lines,
        "Peer identification received"
    );
}

/// Log the negotiated algorithm set
pub fn log_negotiated(kex: &str, host_key: &str, cipher_c2s: &str, cipher_s2c: &str) {
    info!(
        kex = kex,
        host_key = host_key,
        cipher_c2s = cipher_c2s,
        cipher_s2c = cipher_s2c,
        "Algorithms negotiated"
    );
}

/// Log key exchange completion
///
/// # Arguments
///
/// * `session_id` - Session identifier (first exchange hash)
/// * `kex_count` - Number of completed exchanges, this one included
/// * `rekey` - Whether this exchange replaced existing keys
pub fn log_kex_complete(session_id: &[u8], kex_count: u64, rekey: bool) {
    info!(
        session_id = %hex::encode(&session_id[..session_id.len().min(8)]),
        kex_count = kex_count,
        rekey = rekey,
        "Key exchange completed"
    );
}

/// Log a re-key trigger
pub fn log_rekey_start(trigger: &str, bytes_since_kex: u64) {
    info!(
        trigger = trigger,
        bytes_since_kex = bytes_since_kex,
        "Re-key started"
    );
}

/// Log a packet passing through the codec
pub fn log_packet(direction: &str, sequence: u32, msg_type: u8, payload_len: usize) {
    debug!(
        direction = direction,
        seq_num = sequence,
        msg_type = msg_type,
        payload_len = payload_len,
        "SSH packet processed"
    );
}

/// Log a disconnect, sent or received
pub fn log_disconnect(reason_code: u32, description: &str, by_peer: bool) {
    info!(
        reason_code = reason_code,
        description = description,
        by_peer = by_peer,
        "Connection disconnected"
    );
}

/// Log a fatal connection error
pub fn log_fatal_error(context: &str, err: &str) {
    error!(context = context, error = err, "Fatal connection error");
}

/// Log an unusual but tolerated protocol event
pub fn log_protocol_warning(context: &str, detail: &str) {
    warn!(context = context, detail = detail, "Protocol warning");
}

/// Log a channel becoming open
pub fn log_channel_open(local_id: u32, remote_id: u32, channel_type: &str) {
    info!(
        local_id = local_id,
        remote_id = remote_id,
        channel_type = channel_type,
        "Channel open"
    );
}

/// Log a channel open failure
pub fn log_channel_open_failed(local_id: u32, reason: u32, description: &str) {
    warn!(
        local_id = local_id,
        reason = reason,
        description = description,
        "Channel open failed"
    );
}

/// Log a channel release
pub fn log_channel_closed(local_id: u32, reason: &str) {
    info!(local_id = local_id, reason = reason, "Channel closed");
}

/// Log a window adjustment
pub fn log_window_adjust(local_id: u32, direction: &str, bytes: u32, window: u32) {
    debug!(
        local_id = local_id,
        direction = direction,
        bytes = bytes,
        window = window,
        "Channel window adjusted"
    );
}

/// Log an SFTP status reply
pub fn log_sftp_status(request_id: u32, code: u32, message: &str) {
    debug!(
        request_id = request_id,
        status = code,
        message = message,
        "SFTP status"
    );
}

/// Log an idle sweep
pub fn log_idle_sweep(registered: usize, idle: usize, removed: usize) {
    debug!(
        registered = registered,
        idle = idle,
        removed = removed,
        "Idle sweep completed"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logging_functions() {
        log_state_transition("client", "KeyExchange", "Authenticated");
        log_peer_identification("server", "SSH-2.0-Peer", 0);
        log_negotiated("curve25519-sha256", "ssh-ed25519", "aes256-ctr", "aes256-ctr");
        log_kex_complete(&[0xab; 32], 1, false);
        log_kex_complete(&[], 2, true);
        log_rekey_start("bytes", 1 << 30);
        log_packet("in", 7, 94, 1024);
        log_disconnect(11, "bye", true);
        log_fatal_error("transport", "MAC failure");
        log_protocol_warning("mux", "unknown channel");
        log_channel_open(0, 5, "session");
        log_channel_open_failed(1, 3, "unknown channel type");
        log_channel_closed(0, "eof");
        log_window_adjust(0, "out", 1024, 2048);
        log_sftp_status(3, 0, "OK");
        log_idle_sweep(10, 2, 1);
    }
}
