//! Committed entity-transaction dispatch.
//!
//! [`apply_entity_frame`] is the deterministic heart of the E-machine: every
//! validator runs it over the same frame and reaches bit-identical state.
//! Only the proposer replica passes `emit = true`, so cross-entity sends and
//! adapter intents are produced exactly once while state mutations happen
//! everywhere.

use tracing::{debug, info, warn};

use xln_account::machine::{AccountEffect, AccountMachine, TickContext};
use xln_account::proof::CooperativeProof;
use xln_core::constants::BPS_DENOMINATOR;
use xln_core::tx::{
    AccountEnvelope, AccountMessage, AccountTx, EntityTx, EntityTxKind, ForwardIntent, JEvent,
    JEventKind, Outcome, Profile, ProposalAction, VoteChoice,
};
use xln_core::types::{AccountKey, EntityId, Height, StateHash, Timestamp, TokenAmount, TokenId};
use xln_core::XlnError;
use xln_crypto::{keccak256, Keystore};

use crate::state::{EntityState, Proposal, ProposalStatus};

// ── Effects ──────────────────────────────────────────────────────────────────

/// On-chain intents emitted for the `JAdapter` at the tick boundary.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JIntent {
    ReserveToReserve {
        from: EntityId,
        to: EntityId,
        token_id: TokenId,
        amount: TokenAmount,
    },
    PrefundAccount {
        entity: EntityId,
        counterparty: EntityId,
        token_id: TokenId,
        amount: TokenAmount,
    },
}

/// Output of applying a committed frame, beyond the state mutation itself.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EntityEffect {
    /// Bilateral message for a counterparty entity (crosses the entity
    /// boundary at the next tick).
    AccountSend {
        to: EntityId,
        envelope: AccountEnvelope,
    },
    /// Completed (half-signed) cooperative settlement witness.
    Settlement(CooperativeProof),
    /// Intent for the jurisdiction adapter.
    JIntent(JIntent),
    /// Profile record to persist.
    ProfileUpdated(Profile),
}

// ── Frame application ────────────────────────────────────────────────────────

/// Apply a committed frame's transactions, then drive every account machine
/// (propose / time out / retry) so bilateral progress is itself replicated.
pub fn apply_entity_frame(
    state: &mut EntityState,
    txs: &[EntityTx],
    height: Height,
    timestamp: Timestamp,
    ctx: &TickContext,
    keystore: &Keystore,
    emit: bool,
) -> Result<(Vec<EntityEffect>, Vec<Outcome>), XlnError> {
    let mut effects = Vec::new();
    let mut outcomes = Vec::new();

    for tx in txs {
        let last = state.last_nonce(&tx.signer_id);
        if tx.nonce <= last {
            let err = XlnError::NonceReused {
                signer: tx.signer_id.to_string(),
                last,
                got: tx.nonce,
            };
            warn!(entity = %state.entity_id, %err, "rejecting replayed tx");
            outcomes.push(Outcome::failed(state.entity_id, tx, err.to_string()));
            continue;
        }
        // Nonce is consumed even when the handler fails.
        state.nonces.insert(tx.signer_id, tx.nonce);

        match apply_tx(state, tx, ctx, keystore, emit, &mut effects) {
            Ok(()) => outcomes.push(Outcome::applied(state.entity_id, tx)),
            Err(err) => {
                if err.is_fatal() {
                    return Err(err);
                }
                debug!(entity = %state.entity_id, %err, "tx handler failed");
                outcomes.push(Outcome::failed(state.entity_id, tx, err.to_string()));
            }
        }
    }

    // Bilateral service pass: runs on every validator so machine state stays
    // replicated; sends materialize only on the emitting replica.
    let counterparties: Vec<EntityId> = state.accounts.keys().copied().collect();
    for cp in counterparties {
        let machine_effects = {
            let machine = state.accounts.get_mut(&cp).expect("key just listed");
            machine.flush(ctx, keystore, emit)?
        };
        absorb_account_effects(state, cp, machine_effects, &mut effects);
    }

    state.height = height;
    state.timestamp = timestamp;
    Ok((effects, outcomes))
}

/// Route one account machine's effects: sends cross the entity boundary,
/// forwards and rebalances are handled locally (deterministically).
fn absorb_account_effects(
    state: &mut EntityState,
    counterparty: EntityId,
    machine_effects: Vec<AccountEffect>,
    effects: &mut Vec<EntityEffect>,
) {
    for effect in machine_effects {
        match effect {
            AccountEffect::Send(envelope) => effects.push(EntityEffect::AccountSend {
                to: counterparty,
                envelope,
            }),
            AccountEffect::ForwardPayment {
                token_id,
                amount,
                route,
                description,
            } => {
                if let Err(err) = forward_payment(state, token_id, amount, route, description) {
                    // The upstream hop recovers via its proposal timeout.
                    warn!(entity = %state.entity_id, %err, "dropping unforwardable hop payment");
                }
            }
            AccountEffect::RebalanceRequested { token_id, amount } => {
                effects.push(EntityEffect::JIntent(JIntent::PrefundAccount {
                    entity: state.entity_id,
                    counterparty,
                    token_id,
                    amount,
                }));
            }
            AccountEffect::Settlement(proof) => effects.push(EntityEffect::Settlement(proof)),
        }
    }
}

/// Enqueue the next hop of a routed payment, deducting this hop's fee.
fn forward_payment(
    state: &mut EntityState,
    token_id: TokenId,
    amount: TokenAmount,
    route: Vec<EntityId>,
    description: Option<String>,
) -> Result<(), XlnError> {
    let next = *route
        .first()
        .ok_or_else(|| XlnError::InvalidRoute("empty forward route".into()))?;
    let tail: Vec<EntityId> = route[1..].to_vec();

    let our_entity = state.entity_id;
    let machine = state
        .accounts
        .get_mut(&next)
        .ok_or_else(|| XlnError::NoSuchAccount(next.to_string()))?;

    let fee_bps = machine.fee_bps as u128;
    let forwarded = amount * (BPS_DENOMINATOR - fee_bps) / BPS_DENOMINATOR;
    info!(entity = %our_entity, next_hop = %next, amount, forwarded, "forwarding routed payment");

    machine.enqueue(AccountTx::Payment {
        token_id,
        amount: forwarded,
        from: machine.our_side,
        forward: (!tail.is_empty()).then_some(ForwardIntent { route: tail }),
        description,
    });
    Ok(())
}

// ── Per-tx handlers ──────────────────────────────────────────────────────────

fn apply_tx(
    state: &mut EntityState,
    tx: &EntityTx,
    ctx: &TickContext,
    keystore: &Keystore,
    emit: bool,
    effects: &mut Vec<EntityEffect>,
) -> Result<(), XlnError> {
    match &tx.kind {
        // ── OpenAccount ──────────────────────────────────────────────────────
        EntityTxKind::OpenAccount { target, fee_bps } => {
            if *target == state.entity_id {
                return Err(XlnError::InvalidInput("cannot open account with self".into()));
            }
            if state.accounts.contains_key(target) {
                return Ok(()); // idempotent
            }
            let machine = new_machine(state, *target, *fee_bps)?;
            state.accounts.insert(*target, machine);
            info!(entity = %state.entity_id, counterparty = %target, "account created");
            Ok(())
        }

        // ── DirectPayment ────────────────────────────────────────────────────
        EntityTxKind::DirectPayment {
            token_id,
            amount,
            route,
            description,
        } => {
            if *amount == 0 {
                return Err(XlnError::ZeroAmount);
            }
            if route.len() < 2 || route[0] != state.entity_id {
                return Err(XlnError::InvalidRoute(
                    "route must start at this entity and name a destination".into(),
                ));
            }
            if route.len() > xln_core::constants::MAX_ROUTE_HOPS {
                return Err(XlnError::InvalidRoute("route too long".into()));
            }
            let next = route[1];
            let tail: Vec<EntityId> = route[2..].to_vec();
            let machine = state
                .accounts
                .get_mut(&next)
                .ok_or_else(|| XlnError::NoSuchAccount(next.to_string()))?;
            machine.enqueue(AccountTx::Payment {
                token_id: *token_id,
                amount: *amount,
                from: machine.our_side,
                forward: (!tail.is_empty()).then_some(ForwardIntent { route: tail }),
                description: description.clone(),
            });
            Ok(())
        }

        // ── AccountTxs ───────────────────────────────────────────────────────
        EntityTxKind::AccountTxs { counterparty, txs } => {
            let machine = state
                .accounts
                .get_mut(counterparty)
                .ok_or_else(|| XlnError::NoSuchAccount(counterparty.to_string()))?;
            for account_tx in txs {
                machine.enqueue(account_tx.clone());
            }
            Ok(())
        }

        // ── AccountMessage ───────────────────────────────────────────────────
        EntityTxKind::AccountMessage(envelope) => {
            if !state.accounts.contains_key(&envelope.from) {
                // First contact must be an Open; mirror the machine.
                match &envelope.message {
                    AccountMessage::Open { fee_bps, .. } => {
                        let machine = new_machine(state, envelope.from, *fee_bps)?;
                        state.accounts.insert(envelope.from, machine);
                        info!(entity = %state.entity_id, counterparty = %envelope.from, "account mirrored");
                    }
                    _ => return Err(XlnError::UnknownCounterparty(envelope.from.to_string())),
                }
            }
            let machine_effects = {
                let machine = state.accounts.get_mut(&envelope.from).expect("just ensured");
                machine.handle_envelope(envelope, ctx, keystore, emit)?
            };
            absorb_account_effects(state, envelope.from, machine_effects, effects);
            Ok(())
        }

        // ── ExtendCredit ─────────────────────────────────────────────────────
        EntityTxKind::ExtendCredit {
            counterparty,
            token_id,
            amount,
        } => {
            if *amount == 0 {
                return Err(XlnError::ZeroAmount);
            }
            let machine_effects = {
                let machine = state
                    .accounts
                    .get_mut(counterparty)
                    .ok_or_else(|| XlnError::NoSuchAccount(counterparty.to_string()))?;
                machine.extend_credit(*token_id, *amount, emit)?
            };
            absorb_account_effects(state, *counterparty, machine_effects, effects);
            Ok(())
        }

        // ── ReserveToReserve ─────────────────────────────────────────────────
        EntityTxKind::ReserveToReserve {
            target,
            token_id,
            amount,
        } => {
            if *amount == 0 {
                return Err(XlnError::ZeroAmount);
            }
            let have = state.reserves.get(token_id).copied().unwrap_or(0);
            if have < *amount {
                return Err(XlnError::InsufficientReserves {
                    need: *amount,
                    have,
                });
            }
            state.reserves.insert(*token_id, have - *amount);
            if emit {
                effects.push(EntityEffect::JIntent(JIntent::ReserveToReserve {
                    from: state.entity_id,
                    to: *target,
                    token_id: *token_id,
                    amount: *amount,
                }));
            }
            state.log_message(format!(
                "reserve transfer {} of token {} to {}",
                amount, token_id, target
            ));
            Ok(())
        }

        // ── Propose ──────────────────────────────────────────────────────────
        EntityTxKind::Propose { action } => {
            let id = proposal_id(tx);
            if state.proposals.contains_key(&id) {
                return Err(XlnError::InvalidInput("proposal already exists".into()));
            }
            let mut proposal = Proposal {
                id,
                proposer: tx.signer_id,
                action: action.clone(),
                votes: std::collections::BTreeMap::new(),
                status: ProposalStatus::Pending,
                created: state.timestamp,
            };
            // Proposer votes for its own proposal.
            proposal.votes.insert(tx.signer_id, VoteChoice::Yes);
            state.proposals.insert(id, proposal);
            tally_proposal(state, &id);
            Ok(())
        }

        // ── Vote ─────────────────────────────────────────────────────────────
        EntityTxKind::Vote {
            proposal_id,
            choice,
            comment,
        } => {
            let proposal = state
                .proposals
                .get_mut(proposal_id)
                .ok_or_else(|| XlnError::NoSuchProposal(proposal_id.to_string()))?;
            if proposal.status != ProposalStatus::Pending {
                return Err(XlnError::NoSuchProposal(format!(
                    "{proposal_id} is not open for voting"
                )));
            }
            if proposal.votes.contains_key(&tx.signer_id) {
                return Err(XlnError::AlreadyVoted(proposal_id.to_string()));
            }
            proposal.votes.insert(tx.signer_id, *choice);
            if let Some(comment) = comment {
                state.log_message(format!("vote on {proposal_id}: {comment}"));
            }
            tally_proposal(state, proposal_id);
            Ok(())
        }

        // ── UpdateProfile ────────────────────────────────────────────────────
        EntityTxKind::UpdateProfile { profile } => {
            state.profile = profile.clone();
            if emit {
                effects.push(EntityEffect::ProfileUpdated(profile.clone()));
            }
            Ok(())
        }

        // ── JEvent ───────────────────────────────────────────────────────────
        EntityTxKind::JEvent(event) => apply_jevent(state, event),
    }
}

fn new_machine(
    state: &EntityState,
    counterparty: EntityId,
    fee_bps: u32,
) -> Result<AccountMachine, XlnError> {
    let key = AccountKey::new(state.entity_id, counterparty);
    let side = key
        .side_of(&state.entity_id)
        .expect("entity is a party to its own account");
    let signer = state
        .config
        .proposer()
        .ok_or_else(|| XlnError::InvalidInput("entity has no validators".into()))?;
    Ok(AccountMachine::new(key, side, signer, fee_bps))
}

/// Deterministic proposal id: keccak over the proposing tx identity.
fn proposal_id(tx: &EntityTx) -> StateHash {
    let mut data = Vec::new();
    data.extend_from_slice(tx.signer_id.as_bytes());
    data.extend_from_slice(&tx.nonce.to_be_bytes());
    data.extend_from_slice(&tx.canonical_bytes());
    StateHash(keccak256(&data))
}

/// Re-tally a proposal; execute on approval, reject when the threshold is
/// out of reach.
fn tally_proposal(state: &mut EntityState, id: &StateHash) {
    let config = state.config.clone();
    let Some(proposal) = state.proposals.get_mut(id) else {
        return;
    };
    let yes = proposal.weight_of(VoteChoice::Yes, &config);
    let no = proposal.weight_of(VoteChoice::No, &config);
    let total = config.total_shares();

    if yes >= config.threshold {
        proposal.status = ProposalStatus::Approved;
        let action = proposal.action.clone();
        info!(entity = %state.entity_id, proposal = %id, "proposal approved");
        match execute_proposal(state, &action) {
            Ok(()) => {
                if let Some(p) = state.proposals.get_mut(id) {
                    p.status = ProposalStatus::Executed;
                }
            }
            Err(err) => {
                warn!(entity = %state.entity_id, proposal = %id, %err, "approved proposal failed to execute");
            }
        }
    } else if no > total.saturating_sub(config.threshold) {
        proposal.status = ProposalStatus::Rejected;
        info!(entity = %state.entity_id, proposal = %id, "proposal rejected");
    }
}

fn execute_proposal(state: &mut EntityState, action: &ProposalAction) -> Result<(), XlnError> {
    match action {
        ProposalAction::SetThreshold { threshold } => {
            if *threshold == 0 || *threshold > state.config.total_shares() {
                return Err(XlnError::InvalidInput(
                    "threshold must be within total shares".into(),
                ));
            }
            state.config.threshold = *threshold;
            Ok(())
        }
        ProposalAction::AddValidator { signer, shares } => {
            if state.config.is_validator(signer) {
                return Err(XlnError::InvalidInput("validator already present".into()));
            }
            state.config.validators.push(*signer);
            state.config.shares.insert(*signer, *shares);
            Ok(())
        }
        ProposalAction::RemoveValidator { signer } => {
            if state.config.validators.len() <= 1 {
                return Err(XlnError::InvalidInput("cannot remove last validator".into()));
            }
            state.config.validators.retain(|v| v != signer);
            state.config.shares.remove(signer);
            if state.config.threshold > state.config.total_shares() {
                state.config.threshold = state.config.total_shares();
            }
            Ok(())
        }
        ProposalAction::UpdateProfile { profile } => {
            state.profile = profile.clone();
            Ok(())
        }
    }
}

// ── J-events ─────────────────────────────────────────────────────────────────

fn apply_jevent(state: &mut EntityState, event: &JEvent) -> Result<(), XlnError> {
    state.j_block = state.j_block.max(event.block_number);

    match event.kind {
        JEventKind::ReserveCredited => {
            *state.reserves.entry(event.token_id).or_default() += event.amount;
            info!(entity = %state.entity_id, token = event.token_id, amount = event.amount, "reserve credited");
            Ok(())
        }

        JEventKind::CollateralPosted => {
            let counterparty = event
                .counterparty
                .ok_or_else(|| XlnError::InvalidInput("collateral event without counterparty".into()))?;
            // The poster's reserve funds the collateral.
            if event.entity_id == state.entity_id {
                let have = state.reserves.get(&event.token_id).copied().unwrap_or(0);
                if have < event.amount {
                    return Err(XlnError::InsufficientReserves {
                        need: event.amount,
                        have,
                    });
                }
                state.reserves.insert(event.token_id, have - event.amount);
            }
            let machine = account_for_event(state, counterparty, event)?;
            let by = machine
                .key
                .side_of(&event.entity_id)
                .ok_or_else(|| XlnError::UnknownCounterparty(event.entity_id.to_string()))?;
            machine.apply_collateral_posted(event.token_id, event.amount, by);
            Ok(())
        }

        JEventKind::WithdrawalExecuted => {
            let counterparty = event
                .counterparty
                .ok_or_else(|| XlnError::InvalidInput("withdrawal event without counterparty".into()))?;
            let withdrawer = event.entity_id;
            let machine = account_for_event(state, counterparty, event)?;
            let side = machine
                .key
                .side_of(&withdrawer)
                .ok_or_else(|| XlnError::UnknownCounterparty(withdrawer.to_string()))?;
            machine.apply_withdrawal_executed(event.token_id, event.amount, side)?;
            // Withdrawn funds land back in the withdrawer's reserve.
            if withdrawer == state.entity_id {
                *state.reserves.entry(event.token_id).or_default() += event.amount;
            }
            Ok(())
        }

        JEventKind::SettlementApplied => {
            let counterparty = event
                .counterparty
                .ok_or_else(|| XlnError::InvalidInput("settlement event without counterparty".into()))?;
            let toward = event.entity_id;
            let machine = account_for_event(state, counterparty, event)?;
            let side = machine
                .key
                .side_of(&toward)
                .ok_or_else(|| XlnError::UnknownCounterparty(toward.to_string()))?;
            machine.apply_settlement(event.token_id, event.amount, side);
            Ok(())
        }

        JEventKind::DisputeOpened => {
            let counterparty = event
                .counterparty
                .ok_or_else(|| XlnError::InvalidInput("dispute event without counterparty".into()))?;
            let machine = account_for_event(state, counterparty, event)?;
            machine.apply_dispute_opened();
            Ok(())
        }
    }
}

/// Resolve the machine a J-event addresses: `counterparty` is relative to
/// the event's `entity_id`, which may be either party.
fn account_for_event<'a>(
    state: &'a mut EntityState,
    counterparty: EntityId,
    event: &JEvent,
) -> Result<&'a mut AccountMachine, XlnError> {
    let other = if counterparty == state.entity_id {
        event.entity_id
    } else {
        counterparty
    };
    state
        .accounts
        .get_mut(&other)
        .ok_or_else(|| XlnError::NoSuchAccount(other.to_string()))
}
