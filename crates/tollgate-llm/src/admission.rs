//! Text-level admission

use crate::error::Result;
use crate::estimator::Estimator;
use tollgate_core::{AdmissionController, CancellationToken, ReservationHandle};
use tracing::debug;

/// Estimate the input tokens of `text` and reserve capacity for them.
///
/// `estimated_output_tokens == 0` leaves the output side to the
/// controller's estimation strategy. Text that estimates to zero tokens is
/// rejected by the controller as an invalid argument.
pub async fn reserve_for_text<E>(
    controller: &AdmissionController,
    estimator: &E,
    text: &str,
    estimated_output_tokens: u64,
) -> Result<ReservationHandle>
where
    E: Estimator + ?Sized,
{
    reserve_for_text_with_cancel(
        controller,
        estimator,
        text,
        estimated_output_tokens,
        &CancellationToken::new(),
    )
    .await
}

/// [`reserve_for_text`] with caller cancellation
pub async fn reserve_for_text_with_cancel<E>(
    controller: &AdmissionController,
    estimator: &E,
    text: &str,
    estimated_output_tokens: u64,
    cancel: &CancellationToken,
) -> Result<ReservationHandle>
where
    E: Estimator + ?Sized,
{
    let input_tokens = estimator.estimate(text);
    debug!(
        input_tokens,
        estimated_output_tokens,
        text_len = text.len(),
        "Estimated prompt tokens"
    );

    let handle = controller
        .reserve_with_cancel(input_tokens, estimated_output_tokens, cancel)
        .await?;
    Ok(handle)
}
