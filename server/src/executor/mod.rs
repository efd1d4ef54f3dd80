/*
 * Loam Mail Server
 *
 * Copyright (c) 2023 Tibor Djurica Potpara
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as
 * published by the Free Software Foundation, either version 3 of
 * the License, or (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 * in the LICENSE file at the top-level directory of this distribution.
 * You should have received a copy of the GNU Affero General Public License
 * along with this program.  If not, see <http://www.gnu.org/licenses/>.
*/

//! The two executors the server runs on.
//!
//! [`io::IoExecutor`] owns the event loop threads: every socket, TLS stream
//! and session task lives there and must never block. [`worker::WorkerPool`]
//! owns plain OS threads for work that does block, i.e. database access.
//! Session code crosses from the first to the second with
//! [`worker::WorkerPool::submit`] and awaits the returned handle.

pub mod io;
pub mod worker;
