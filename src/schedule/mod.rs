//! Pure scheduling rules: availability windows, slot listing, booking
//! validation and the appointment status machine.
//!
//! Nothing here does I/O, reads the clock or logs. Callers pass in a
//! snapshot (windows, booked intervals, `now`, clinic zone) and get a value
//! back, so every function is safe to call from any task without locking.

mod booking;
mod error;
mod overlap;
mod policy;
mod slots;
mod time_of_day;
mod window;

#[cfg(test)]
mod properties;

pub use booking::{AcceptedBooking, BookingRequest, parse_requested_start, validate};
pub use error::Rejection;
pub use overlap::{BookedInterval, overlaps, overlaps_any};
pub use policy::{
    Actor, AppointmentStatus, AppointmentView, Role, authorize_admin, authorize_availability_edit,
    authorize_booking, authorize_cancel, authorize_own_appointments, authorize_provider_schedule,
};
pub use slots::{SlotQuery, generate};
pub use time_of_day::{TimeOfDay, iso_weekday, parse_iso_weekday};
pub use window::{AvailabilityWindow, day_start, resolve};
